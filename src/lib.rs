//! # retrying-http
//!
//! Asynchronous HTTP request execution with retry, back-off and fast
//! retry on network changes.
//!
//! ## Design Philosophy
//!
//! - **Explicit contexts** - every task runs on an [`ExecutionContext`]
//!   chosen by the caller; nothing falls back to a hidden default
//! - **Bounded transfers** - attempts go through the transfer queue of a
//!   [`Dispatcher`] that the application owns and passes in
//! - **Retry only what can change** - 5xx and connectivity failures are
//!   retried; 4xx, wrong content types and oversized bodies are not
//! - **Library-first** - no global state; the application wires a
//!   [`RetryEnvironment`] once and shares it
//!
//! ## Quick Start
//!
//! ```no_run
//! use retrying_http::{Config, ExecutionContext, HttpRequest, RetryEnvironment, RetryingRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client_context = ExecutionContext::current("client")?;
//!     let network_context = ExecutionContext::dedicated("network")?;
//!     let env = RetryEnvironment::new(&Config::default(), client_context)?;
//!
//!     let request = HttpRequest::get("https://example.com/feed.json", &env.transfer)?;
//!     let retrying = RetryingRequest::new(request, &env)
//!         .with_acceptable_content_types(["application/json"]);
//!     let progress = retrying.progress();
//!
//!     let mut submission = retrying.submit(&network_context);
//!     if let Some(result) = submission.finished().await {
//!         let response = result?;
//!         println!(
//!             "{} after {} retries",
//!             response.metadata.status,
//!             progress.retry_count()
//!         );
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Serial execution contexts
pub mod context;
/// Task queues
pub mod dispatcher;
/// Error types
pub mod error;
/// Host-success broadcasts
pub mod events;
pub mod http;
pub mod orchestrator;
pub mod reachability;
/// Retry classification and back-off
pub mod retry;
/// Task lifecycle
pub mod task;

// Re-export commonly used types
pub use config::{Config, DispatcherConfig, ReachabilityConfig, RetryConfig, TransferConfig};
pub use context::ExecutionContext;
pub use dispatcher::{Dispatcher, QueueKind, Submission, SubmissionId};
pub use error::{ERROR_DOMAIN, Error, Result};
pub use events::{HostEventBus, HostSubscription, HostSuccess};
pub use http::{
    AuthenticationDelegate, HttpRequest, HttpRequestTask, HttpResponse, OutputSink, ResponseBody,
    ResponseMetadata, StatusSet,
};
pub use orchestrator::{ClientView, RetryEnvironment, RetryProgress, RetryState, RetryingRequest};
pub use reachability::{
    ManualReachability, PollingReachability, ReachabilityFlags, ReachabilityMonitor,
    ReachabilityTask,
};
pub use retry::{BackoffSchedule, IsRetryable};
pub use task::{Task, TaskHandle, TaskState, TaskStatus, spawn_task};
