//! Host-success event bus
//!
//! When a request to a host succeeds, every orchestrator currently waiting
//! to retry a request to the same host should retry right away. The bus
//! is an explicit registry: a subscription is created on entry to the
//! waiting state and removed when the [`HostSubscription`] is dropped, so no
//! observer outlives the wait it belongs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// A request to `host` completed successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSuccess {
    /// Lower-cased host name
    pub host: String,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<HostSuccess>>>>,
}

/// Cloneable handle to a host-success registry
#[derive(Clone, Default)]
pub struct HostEventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for HostEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEventBus")
            .field("hosts", &self.lock().len())
            .finish()
    }
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl HostEventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u64, mpsc::UnboundedSender<HostSuccess>>>>
    {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start listening for successes against `host`
    pub fn subscribe(&self, host: &str) -> HostSubscription {
        let host = normalize(host);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(host.clone()).or_default().insert(id, tx);
        HostSubscription {
            bus: self.clone(),
            host,
            id,
            rx,
        }
    }

    /// Tell every current subscriber of `host` that a request succeeded
    ///
    /// Returns the number of subscribers notified.
    pub fn publish(&self, host: &str) -> usize {
        let host = normalize(host);
        let senders: Vec<_> = match self.lock().get(&host) {
            Some(subs) => subs.values().cloned().collect(),
            None => return 0,
        };
        let event = HostSuccess { host: host.clone() };
        let delivered = senders
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count();
        tracing::debug!(host = %host, subscribers = delivered, "published host success");
        delivered
    }

    /// Number of live subscriptions for `host`
    pub fn subscriber_count(&self, host: &str) -> usize {
        self.lock().get(&normalize(host)).map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, host: &str, id: u64) {
        let mut subscribers = self.lock();
        if let Some(subs) = subscribers.get_mut(host) {
            subs.remove(&id);
            if subs.is_empty() {
                subscribers.remove(host);
            }
        }
    }
}

/// Live registration on a [`HostEventBus`]; unsubscribes on drop
pub struct HostSubscription {
    bus: HostEventBus,
    host: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<HostSuccess>,
}

impl HostSubscription {
    /// Host this subscription listens to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Wait for the next success against the host
    pub async fn recv(&mut self) -> Option<HostSuccess> {
        self.rx.recv().await
    }
}

impl Drop for HostSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.host, self.id);
    }
}
