//! Host reachability
//!
//! A [`ReachabilityMonitor`] turns a host name into a stream of
//! [`ReachabilityFlags`]; a [`ReachabilityTask`] waits on that stream until
//! the flags match a target.

mod flags;
mod monitor;
mod task;

pub use flags::ReachabilityFlags;
pub use monitor::{ManualReachability, PollingReachability, ReachabilityMonitor, ReachabilityWatch};
pub use task::ReachabilityTask;
