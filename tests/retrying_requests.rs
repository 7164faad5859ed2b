//! End-to-end tests for retrying requests against a local HTTP fixture
//!
//! Each test starts a wiremock server on 127.0.0.1, wires a
//! `RetryEnvironment` with manual reachability and short back-off ceilings,
//! and drives `RetryingRequest`s through the dispatcher.

mod common;

use common::{MOCK_HOST, environment, get, wait_for_state};
use futures::future::join_all;
use retrying_http::{
    Config, ERROR_DOMAIN, Error, ExecutionContext, IsRetryable, ManualReachability,
    QueueKind, ReachabilityFlags, RetryEnvironment, RetryState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn one_success_releases_every_waiting_sibling() {
    let server = MockServer::start().await;
    for route in ["/b1", "/b2", "/b3"] {
        Mock::given(path(route))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(path(route))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
    }
    Mock::given(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = environment(Duration::from_secs(3600), &ManualReachability::new());
    let ctx = ExecutionContext::current("network").unwrap();

    let mut waiting = Vec::new();
    for route in ["/b1", "/b2", "/b3"] {
        let request = get(&server, route, &env);
        let progress = request.progress();
        let submission = request.submit(&ctx);
        wait_for_state(&progress, RetryState::WaitingToRetry).await;
        waiting.push((progress, submission));
    }
    assert_eq!(env.events.subscriber_count(MOCK_HOST), 3);

    get(&server, "/a", &env)
        .submit(&ctx)
        .finished()
        .await
        .unwrap()
        .unwrap();

    for (progress, mut submission) in waiting {
        let result = tokio::time::timeout(Duration::from_secs(5), submission.finished())
            .await
            .expect("host success should end the wait")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(progress.retry_count(), 1);
    }
    assert_eq!(env.events.subscriber_count(MOCK_HOST), 0);
}

#[tokio::test]
async fn transfer_width_bounds_concurrent_attempts() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(40)))
        .mount(&server)
        .await;

    let config = Config::from_json_str(
        r#"{ "dispatcher": { "transfer_width": 2 }, "retry": { "schedule": [1] } }"#,
    )
    .unwrap();
    let client = ExecutionContext::current("client").unwrap();
    let env = RetryEnvironment::new(&config, client)
        .unwrap()
        .with_reachability(Arc::new(ManualReachability::new()));
    let ctx = ExecutionContext::current("network").unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let mut in_use = env.dispatcher.subscribe_network_in_use();
    let watcher = {
        let peak = peak.clone();
        tokio::spawn(async move {
            while in_use.changed().await.is_ok() {
                let running = *in_use.borrow_and_update();
                peak.fetch_max(running, Ordering::SeqCst);
            }
        })
    };

    let submissions: Vec<_> = (0..6)
        .map(|_| get(&server, "/slow", &env).submit(&ctx))
        .collect();
    let results = join_all(
        submissions
            .into_iter()
            .map(|mut submission| async move { submission.finished().await }),
    )
    .await;
    watcher.abort();

    assert!(results.into_iter().all(|r| matches!(r, Some(Ok(_)))));
    assert!(!env.dispatcher.network_in_use());
    assert_eq!(env.dispatcher.queue_width(QueueKind::Transfer), Some(2));
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak of {peak} concurrent transfers");
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn orchestrator_on_a_dedicated_context_reports_to_the_client() {
    let server = MockServer::start().await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
        .mount(&server)
        .await;

    let env = environment(Duration::from_millis(2), &ManualReachability::new());
    let network = ExecutionContext::dedicated("network").unwrap();
    let request = get(&server, "/x", &env);
    let progress = request.progress();
    let mut client_view = progress.subscribe_client_view();

    let response = request.submit(&network).finished().await.unwrap().unwrap();
    assert_eq!(response.body.bytes(), Some(&b"fine"[..]));
    assert_eq!(progress.retry_count(), 2);

    client_view
        .wait_for(|v| v.state == RetryState::Finished && v.has_had_retryable_failure)
        .await
        .unwrap();
}

#[tokio::test]
async fn reachability_recovery_and_terminal_codes() {
    let server = MockServer::start().await;
    Mock::given(path("/maintenance"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/maintenance"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let reachability = ManualReachability::new();
    let env = environment(Duration::from_secs(3600), &reachability);
    let ctx = ExecutionContext::current("network").unwrap();
    let request = get(&server, "/maintenance", &env);
    let progress = request.progress();
    let mut submission = request.submit(&ctx);

    wait_for_state(&progress, RetryState::WaitingToRetry).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    reachability.set_flags(MOCK_HOST, ReachabilityFlags::REACHABLE);

    let err = tokio::time::timeout(Duration::from_secs(5), submission.finished())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, Error::Status { code: 403 }));
    assert!(!err.is_retryable());
    assert_eq!(err.domain_code(), Some(403));
    assert_eq!(ERROR_DOMAIN, "retrying_http");
    assert_eq!(progress.retry_count(), 1);
    assert_eq!(progress.response().unwrap().status.as_u16(), 403);
}
