//! Sources of reachability flags

use super::flags::ReachabilityFlags;
use crate::config::ReachabilityConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Live view of one host's reachability flags
///
/// The value is `None` until the monitor has determined the flags once.
/// Dropping the watch releases whatever the monitor allocated for it.
#[derive(Debug)]
pub struct ReachabilityWatch {
    host: String,
    rx: watch::Receiver<Option<ReachabilityFlags>>,
}

impl ReachabilityWatch {
    /// Wrap a flag receiver
    pub fn new(host: impl Into<String>, rx: watch::Receiver<Option<ReachabilityFlags>>) -> Self {
        Self {
            host: host.into(),
            rx,
        }
    }

    /// Host being watched
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Latest flags, if known yet
    pub fn current(&mut self) -> Option<ReachabilityFlags> {
        *self.rx.borrow_and_update()
    }

    /// Wait for the next known flags; `None` once the source is gone
    pub async fn changed(&mut self) -> Option<ReachabilityFlags> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(flags) = *self.rx.borrow_and_update() {
                return Some(flags);
            }
        }
    }
}

/// Something that reports reachability flag changes for hosts
pub trait ReachabilityMonitor: Send + Sync {
    /// Start watching `host`
    ///
    /// The watch delivers the current flags as soon as they are known and
    /// every change afterwards. Must be called from within a tokio runtime.
    fn watch(&self, host: &str) -> ReachabilityWatch;
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Resolves the host periodically and reports the result
///
/// A host that resolves is `REACHABLE`; if every address is loopback it is
/// also `IS_LOCAL_ADDRESS | IS_DIRECT`. A failed lookup reports no flags.
#[derive(Debug, Clone)]
pub struct PollingReachability {
    interval: Duration,
}

impl Default for PollingReachability {
    fn default() -> Self {
        Self::new(&ReachabilityConfig::default())
    }
}

impl PollingReachability {
    /// Poll at the configured interval
    pub fn new(config: &ReachabilityConfig) -> Self {
        Self {
            interval: config.poll_interval,
        }
    }

    /// Resolve `host` once and classify the result
    pub async fn probe(host: &str) -> ReachabilityFlags {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => flags_for(addrs),
            Err(e) => {
                tracing::trace!(host = %host, error = %e, "host lookup failed");
                ReachabilityFlags::empty()
            }
        }
    }
}

fn flags_for(addrs: impl IntoIterator<Item = SocketAddr>) -> ReachabilityFlags {
    let mut any = false;
    let mut all_loopback = true;
    for addr in addrs {
        any = true;
        all_loopback &= addr.ip().is_loopback();
    }
    match (any, all_loopback) {
        (false, _) => ReachabilityFlags::empty(),
        (true, true) => {
            ReachabilityFlags::REACHABLE
                | ReachabilityFlags::IS_LOCAL_ADDRESS
                | ReachabilityFlags::IS_DIRECT
        }
        (true, false) => ReachabilityFlags::REACHABLE,
    }
}

impl ReachabilityMonitor for PollingReachability {
    fn watch(&self, host: &str) -> ReachabilityWatch {
        let host = normalize(host);
        let (tx, rx) = watch::channel(None);
        let interval = self.interval;
        let polled = host.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let flags = PollingReachability::probe(&polled).await;
                        tx.send_if_modified(|current| {
                            if *current == Some(flags) {
                                false
                            } else {
                                tracing::debug!(host = %polled, flags = %flags, "reachability changed");
                                *current = Some(flags);
                                true
                            }
                        });
                    }
                }
            }
            tracing::trace!(host = %polled, "reachability polling stopped");
        });

        ReachabilityWatch::new(host, rx)
    }
}

/// Flags set by the embedding application
///
/// For platforms that already have a reachability API, and for tests.
/// Hosts never set report no flags.
#[derive(Debug, Clone, Default)]
pub struct ManualReachability {
    hosts: Arc<Mutex<HashMap<String, watch::Sender<Option<ReachabilityFlags>>>>>,
}

impl ManualReachability {
    /// Empty monitor; every host starts with no flags
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sender<R>(
        &self,
        host: &str,
        f: impl FnOnce(&watch::Sender<Option<ReachabilityFlags>>) -> R,
    ) -> R {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = hosts
            .entry(normalize(host))
            .or_insert_with(|| watch::channel(Some(ReachabilityFlags::empty())).0);
        f(sender)
    }

    /// Set the flags of `host`, notifying watchers if they changed
    pub fn set_flags(&self, host: &str, flags: ReachabilityFlags) {
        self.with_sender(host, |tx| {
            tx.send_if_modified(|current| {
                let changed = *current != Some(flags);
                *current = Some(flags);
                changed
            });
        });
    }

    /// Current flags of `host`
    pub fn flags(&self, host: &str) -> ReachabilityFlags {
        self.with_sender(host, |tx| tx.borrow().unwrap_or_default())
    }
}

impl ReachabilityMonitor for ManualReachability {
    fn watch(&self, host: &str) -> ReachabilityWatch {
        let rx = self.with_sender(host, watch::Sender::subscribe);
        ReachabilityWatch::new(normalize(host), rx)
    }
}
