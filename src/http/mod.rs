//! One-shot HTTP transfers
//!
//! [`HttpRequestTask`] performs a single request with no retry of its own:
//! it sends the [`HttpRequest`], answers authentication challenges through an
//! optional [`AuthenticationDelegate`], streams the body into an
//! [`OutputSink`] and judges the outcome against a [`ResponsePolicy`].

pub mod auth;
pub mod request;
pub mod sink;
mod task;

pub use auth::{
    AuthenticationChallenge, AuthenticationDelegate, ChallengeDisposition, Credential,
    MAX_CHALLENGE_ROUNDS, ProtectionSpace,
};
pub use request::{HttpRequest, ResponseMetadata, ResponsePolicy, ResponseSlot, StatusSet};
pub use sink::{OutputSink, ResponseBody};
pub use task::{HttpRequestTask, HttpResponse};
