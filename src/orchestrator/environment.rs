//! Collaborators shared by every retrying request

use crate::config::{Config, TransferConfig};
use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::events::HostEventBus;
use crate::reachability::{PollingReachability, ReachabilityMonitor};
use crate::retry::BackoffSchedule;
use std::sync::Arc;

/// Everything a [`RetryingRequest`](super::RetryingRequest) needs besides
/// its own request
///
/// Cheap to clone. Build one per application from a [`Config`] and pass it
/// to each request.
#[derive(Clone)]
pub struct RetryEnvironment {
    /// Queues for attempts and reachability watches
    pub dispatcher: Dispatcher,
    /// Host-success broadcasts
    pub events: HostEventBus,
    /// Reachability flag source
    pub reachability: Arc<dyn ReachabilityMonitor>,
    /// Shared HTTP client
    pub client: reqwest::Client,
    /// Per-attempt transfer settings
    pub transfer: TransferConfig,
    /// Backoff ceilings
    pub schedule: BackoffSchedule,
    /// Context on which client-visible state changes and completions arrive
    pub client_context: ExecutionContext,
}

impl std::fmt::Debug for RetryEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEnvironment")
            .field("dispatcher", &self.dispatcher)
            .field("schedule", &self.schedule)
            .field("client_context", &self.client_context)
            .finish_non_exhaustive()
    }
}

impl RetryEnvironment {
    /// Build from `config`, polling reachability by DNS lookup
    pub fn new(config: &Config, client_context: ExecutionContext) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(&config.dispatcher)?,
            events: HostEventBus::new(),
            reachability: Arc::new(PollingReachability::new(&config.reachability)),
            client: config.http_client()?,
            transfer: config.transfer.clone(),
            schedule: BackoffSchedule::try_from(&config.retry)?,
            client_context,
        })
    }

    /// Use a different reachability source
    pub fn with_reachability(mut self, monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        self.reachability = monitor;
        self
    }

    /// Share an existing host-success bus
    pub fn with_events(mut self, events: HostEventBus) -> Self {
        self.events = events;
        self
    }
}
