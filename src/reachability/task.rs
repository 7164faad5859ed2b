//! Waits until a host's reachability reaches a target

use super::flags::ReachabilityFlags;
use super::monitor::{ReachabilityMonitor, ReachabilityWatch};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::task::Task;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Finishes when `(flags & mask) == value` for its host
///
/// There is no failure path other than cancellation: if the flags never
/// match, the task runs until cancelled. The default target is
/// "reachable" (mask and value both [`ReachabilityFlags::REACHABLE`]).
pub struct ReachabilityTask {
    host: String,
    mask: ReachabilityFlags,
    value: ReachabilityFlags,
    monitor: Arc<dyn ReachabilityMonitor>,
    watch: Option<ReachabilityWatch>,
    flags: watch::Sender<ReachabilityFlags>,
}

impl std::fmt::Debug for ReachabilityTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityTask")
            .field("host", &self.host)
            .field("mask", &self.mask)
            .field("value", &self.value)
            .field("flags", &*self.flags.borrow())
            .finish()
    }
}

impl ReachabilityTask {
    /// Watch `host` through `monitor`
    pub fn new(host: &str, monitor: Arc<dyn ReachabilityMonitor>) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "reachability host name must not be empty".into(),
            ));
        }
        let (flags, _) = watch::channel(ReachabilityFlags::empty());
        Ok(Self {
            host: host.to_string(),
            mask: ReachabilityFlags::REACHABLE,
            value: ReachabilityFlags::REACHABLE,
            monitor,
            watch: None,
            flags,
        })
    }

    /// Change the target condition
    pub fn with_target(mut self, mask: ReachabilityFlags, value: ReachabilityFlags) -> Self {
        self.mask = mask;
        self.value = value;
        self
    }

    /// Finish when the host is no longer reachable
    pub fn until_unreachable(self) -> Self {
        self.with_target(ReachabilityFlags::REACHABLE, ReachabilityFlags::empty())
    }

    /// Host being watched
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Observe the flags as the task sees them
    pub fn subscribe_flags(&self) -> watch::Receiver<ReachabilityFlags> {
        self.flags.subscribe()
    }
}

#[async_trait]
impl Task for ReachabilityTask {
    type Output = ReachabilityFlags;

    fn describe(&self) -> String {
        format!("reachability {} ({}={})", self.host, self.mask, self.value)
    }

    async fn on_start(&mut self, _context: &ExecutionContext) -> Result<()> {
        self.watch = Some(self.monitor.watch(&self.host));
        Ok(())
    }

    async fn execute(&mut self, _context: &ExecutionContext) -> Result<ReachabilityFlags> {
        let Some(watch) = self.watch.as_mut() else {
            return Err(Error::Other("reachability watch was not opened".into()));
        };

        let mut next = watch.current();
        loop {
            if let Some(flags) = next {
                self.flags.send_replace(flags);
                if flags.matches(self.mask, self.value) {
                    tracing::debug!(host = %self.host, flags = %flags, "reachability target reached");
                    return Ok(flags);
                }
            }
            next = watch.changed().await;
            if next.is_none() {
                // Source gone; nothing more will change
                std::future::pending::<()>().await;
            }
        }
    }

    async fn on_will_finish(&mut self, _error: Option<&Error>) {
        self.watch = None;
    }
}
