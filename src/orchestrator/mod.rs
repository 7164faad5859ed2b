//! Retrying HTTP requests
//!
//! A [`RetryingRequest`] is itself a task on the management queue. It owns at
//! most one live attempt, or, between attempts, one wait made of a back-off
//! timer, a reachability watch and a host-success subscription. Its progress
//! is observable through [`RetryProgress`], including a [`ClientView`] that
//! only changes on the client context.

mod environment;
mod request;
mod state;

pub use environment::RetryEnvironment;
pub use request::RetryingRequest;
pub use state::{ClientView, RetryProgress, RetryState};
