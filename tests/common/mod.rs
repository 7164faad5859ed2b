//! Common test utilities for retrying-http integration tests

#![allow(dead_code)]

use retrying_http::{
    Config, ExecutionContext, HttpRequest, ManualReachability, RetryConfig, RetryEnvironment,
    RetryProgress, RetryState, RetryingRequest,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

/// Host wiremock servers listen on
pub const MOCK_HOST: &str = "127.0.0.1";

/// Environment with a single back-off ceiling and manual reachability
///
/// Client updates and completions arrive on the test's own runtime.
pub fn environment(ceiling: Duration, reachability: &ManualReachability) -> RetryEnvironment {
    let config = Config {
        retry: RetryConfig {
            schedule: vec![ceiling],
        },
        ..Config::default()
    };
    let client = ExecutionContext::current("client").expect("tests run inside a tokio runtime");
    RetryEnvironment::new(&config, client)
        .expect("test config is valid")
        .with_reachability(Arc::new(reachability.clone()))
}

/// A GET against `route` on `server`
pub fn get(server: &MockServer, route: &str, env: &RetryEnvironment) -> RetryingRequest {
    let request = HttpRequest::get(&format!("{}{route}", server.uri()), &env.transfer)
        .expect("mock server URI is valid");
    RetryingRequest::new(request, env)
}

/// Wait (up to 5 seconds) for the internal retry state to reach `state`
pub async fn wait_for_state(progress: &RetryProgress, state: RetryState) {
    let mut rx = progress.subscribe_retry_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("progress dropped");
}
