//! The retry orchestrator

use super::environment::RetryEnvironment;
use super::state::{RetryProgress, RetryState};
use crate::context::ExecutionContext;
use crate::dispatcher::{QueueKind, Submission, SubmissionId};
use crate::error::{Error, Result};
use crate::http::{AuthenticationDelegate, HttpRequest, HttpRequestTask, HttpResponse, OutputSink};
use crate::reachability::{ReachabilityFlags, ReachabilityTask};
use crate::retry::IsRetryable;
use crate::task::Task;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// What ended a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Reachable,
    HostSuccess,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Trigger::Timer => "timer",
            Trigger::Reachable => "reachability",
            Trigger::HostSuccess => "host success",
        })
    }
}

/// Which half of the reachability wait is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReachabilityPhase {
    AwaitUnreachable,
    AwaitReachable,
}

/// Runs an idempotent HTTP request until it succeeds or fails for good
///
/// Each attempt is an [`HttpRequestTask`] on the transfer queue. A retryable
/// failure (see [`IsRetryable`]) starts a wait that ends on whichever comes
/// first:
/// - the randomized back-off timer
/// - the host going from unreachable to reachable
/// - another request to the same host succeeding
///
/// Only use this for requests that are safe to repeat.
pub struct RetryingRequest {
    env: RetryEnvironment,
    request: HttpRequest,
    content_types: Option<Vec<String>>,
    response_file: Option<PathBuf>,
    delegate: Option<Arc<dyn AuthenticationDelegate>>,
    progress: RetryProgress,
    attempt: Option<SubmissionId>,
    reachability: Option<SubmissionId>,
}

impl std::fmt::Debug for RetryingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingRequest")
            .field("request", &self.request)
            .field("progress", &self.progress)
            .field("response_file", &self.response_file)
            .finish_non_exhaustive()
    }
}

impl RetryingRequest {
    /// Prepare `request`; nothing is sent until the request is started
    pub fn new(request: HttpRequest, env: &RetryEnvironment) -> Self {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            progress: RetryProgress::new(sequence, env.client_context.clone()),
            env: env.clone(),
            request,
            content_types: None,
            response_file: None,
            delegate: None,
            attempt: None,
            reachability: None,
        }
    }

    /// Accept only these MIME types (default: anything)
    pub fn with_acceptable_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Write the body to `path` instead of memory; each attempt recreates the file
    pub fn with_response_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.response_file = Some(path.into());
        self
    }

    /// Answer authentication challenges on every attempt
    pub fn with_authentication_delegate(mut self, delegate: Arc<dyn AuthenticationDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// The request being retried
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Observable progress; stays valid after the request is submitted
    pub fn progress(&self) -> RetryProgress {
        self.progress.clone()
    }

    /// Submit to the management queue of the environment's dispatcher
    ///
    /// The orchestrator runs on `run_on`; its completion is delivered on the
    /// environment's client context.
    pub fn submit(self, run_on: &ExecutionContext) -> Submission<HttpResponse> {
        let dispatcher = self.env.dispatcher.clone();
        let client_context = self.env.client_context.clone();
        dispatcher.submit(QueueKind::Management, self, run_on, &client_context)
    }

    fn attempt_task(&self) -> HttpRequestTask {
        let mut task = HttpRequestTask::new(self.env.client.clone(), self.request.clone(), &self.env.transfer);
        if let Some(types) = &self.content_types {
            task = task.with_acceptable_content_types(types);
        }
        if let Some(path) = &self.response_file {
            task = task.with_output(OutputSink::File(path.clone()));
        }
        if let Some(delegate) = &self.delegate {
            task = task.with_authentication_delegate(delegate.clone());
        }
        task
    }

    /// Run one attempt on the transfer queue and wait for it
    async fn run_attempt(&mut self, context: &ExecutionContext) -> Result<HttpResponse> {
        let task = self.attempt_task();
        let slot = task.response_slot();
        let mut submission = self
            .env
            .dispatcher
            .submit(QueueKind::Transfer, task, context, context);
        self.attempt = Some(submission.id());

        let result = submission.finished().await.unwrap_or(Err(Error::Cancelled));
        self.attempt = None;

        if let Some(metadata) = slot.get() {
            self.progress.record_response(metadata.clone());
        }
        result
    }

    fn watch_reachability(
        &mut self,
        context: &ExecutionContext,
        phase: ReachabilityPhase,
    ) -> Option<Submission<ReachabilityFlags>> {
        let task = match ReachabilityTask::new(self.request.host(), self.env.reachability.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(request = self.progress.sequence(), error = %e, "cannot watch reachability");
                return None;
            }
        };
        let task = match phase {
            ReachabilityPhase::AwaitUnreachable => task.until_unreachable(),
            ReachabilityPhase::AwaitReachable => task,
        };
        let submission = self
            .env
            .dispatcher
            .submit(QueueKind::Management, task, context, context);
        self.reachability = Some(submission.id());
        Some(submission)
    }

    fn stop_reachability(&mut self) {
        if let Some(id) = self.reachability.take() {
            self.env.dispatcher.cancel(id);
        }
    }

    /// Wait for the timer, a reachability change or a sibling success
    async fn wait_to_retry(&mut self, context: &ExecutionContext, delay: Duration) -> Trigger {
        let mut subscription = self.env.events.subscribe(self.request.host());
        let mut subscribed = true;
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        let mut phase = ReachabilityPhase::AwaitUnreachable;
        let mut reachability = self.watch_reachability(context, phase);

        let trigger = loop {
            tokio::select! {
                _ = &mut timer => break Trigger::Timer,
                event = subscription.recv(), if subscribed => {
                    if event.is_some() {
                        break Trigger::HostSuccess;
                    }
                    subscribed = false;
                }
                outcome = next_flags(&mut reachability) => match (phase, outcome) {
                    (ReachabilityPhase::AwaitUnreachable, Some(Ok(flags))) => {
                        debug!(request = self.progress.sequence(), flags = %flags, "host unreachable; waiting for it to return");
                        phase = ReachabilityPhase::AwaitReachable;
                        reachability = self.watch_reachability(context, phase);
                    }
                    (ReachabilityPhase::AwaitReachable, Some(Ok(_))) => {
                        self.reachability = None;
                        break Trigger::Reachable;
                    }
                    (_, _) => {
                        self.reachability = None;
                        reachability = None;
                    }
                },
            }
        };

        self.stop_reachability();
        drop(subscription);
        trigger
    }
}

/// Next reachability completion, or never if no watch is running
async fn next_flags(
    submission: &mut Option<Submission<ReachabilityFlags>>,
) -> Option<Result<ReachabilityFlags>> {
    match submission {
        Some(submission) => submission.finished().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Task for RetryingRequest {
    type Output = HttpResponse;

    fn describe(&self) -> String {
        format!("retrying #{} {}", self.progress.sequence(), self.request.url())
    }

    async fn execute(&mut self, context: &ExecutionContext) -> Result<HttpResponse> {
        let sequence = self.progress.sequence();
        let host = self.request.host().to_string();

        loop {
            let retry_count = self.progress.retry_count();
            let state = if retry_count == 0 {
                RetryState::Attempting
            } else {
                RetryState::Retrying
            };
            self.progress.set_state(state);
            debug!(request = sequence, url = %self.request.url(), attempt = retry_count + 1, "starting attempt");

            match self.run_attempt(context).await {
                Ok(response) => {
                    if retry_count > 0 {
                        info!(request = sequence, host = %host, retry_count, "request succeeded after retrying");
                    } else {
                        debug!(request = sequence, host = %host, "request succeeded");
                    }
                    self.progress.record_success(&response);
                    self.env.events.publish(&host);
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => {
                    if !e.is_cancelled() {
                        error!(request = sequence, host = %host, error = %e, retry_count, "request failed");
                    }
                    return Err(e);
                }
                Err(e) => {
                    let retry_count = self.progress.record_retryable_failure();
                    let delay = self.env.schedule.delay(retry_count);
                    warn!(
                        request = sequence,
                        host = %host,
                        error = %e,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, waiting to retry"
                    );
                    self.progress.set_state(RetryState::WaitingToRetry);
                    let trigger = self.wait_to_retry(context, delay).await;
                    debug!(request = sequence, host = %host, trigger = %trigger, "retrying");
                }
            }
        }
    }

    async fn on_will_finish(&mut self, _error: Option<&Error>) {
        if let Some(id) = self.attempt.take() {
            self.env.dispatcher.cancel(id);
        }
        self.stop_reachability();
        self.progress.set_state(RetryState::Finished);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RetryConfig};
    use crate::reachability::ManualReachability;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn environment(ceiling: Duration, reachability: &ManualReachability) -> RetryEnvironment {
        let config = Config {
            retry: RetryConfig {
                schedule: vec![ceiling],
            },
            ..Config::default()
        };
        RetryEnvironment::new(&config, ExecutionContext::current("client").unwrap())
            .unwrap()
            .with_reachability(Arc::new(reachability.clone()))
    }

    fn get(server: &MockServer, route: &str, env: &RetryEnvironment) -> RetryingRequest {
        let request = HttpRequest::get(&format!("{}{route}", server.uri()), &env.transfer).unwrap();
        RetryingRequest::new(request, env)
    }

    async fn wait_for_state(progress: &RetryProgress, state: RetryState) {
        let mut rx = progress.subscribe_retry_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        Mock::given(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("done", "text/plain"))
            .mount(&server)
            .await;

        let env = environment(Duration::from_millis(5), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/flaky", &env);
        let progress = request.progress();
        let mut view = progress.subscribe_client_view();

        let response = request.submit(&ctx).finished().await.unwrap().unwrap();

        assert_eq!(response.metadata.status.as_u16(), 200);
        assert_eq!(progress.retry_count(), 3);
        assert_eq!(progress.response_content(), Some(b"done".to_vec()));
        assert_eq!(progress.response_mime_type().as_deref(), Some("text/plain"));
        assert_eq!(
            progress.transitions(),
            vec![
                RetryState::NotStarted,
                RetryState::Attempting,
                RetryState::WaitingToRetry,
                RetryState::Retrying,
                RetryState::WaitingToRetry,
                RetryState::Retrying,
                RetryState::WaitingToRetry,
                RetryState::Retrying,
                RetryState::Finished,
            ]
        );
        view.wait_for(|v| v.state == RetryState::Finished && v.has_had_retryable_failure)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn client_errors_finish_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let env = environment(Duration::from_millis(5), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/gone", &env);
        let progress = request.progress();

        let err = request.submit(&ctx).finished().await.unwrap().unwrap_err();

        assert_eq!(err.status_code(), Some(404));
        assert_eq!(progress.retry_count(), 0);
        assert_eq!(progress.response().unwrap().status.as_u16(), 404);
        assert_eq!(
            progress.transitions(),
            vec![
                RetryState::NotStarted,
                RetryState::Attempting,
                RetryState::Finished
            ]
        );
        assert!(!progress.has_had_retryable_failure());
    }

    #[tokio::test]
    async fn oversized_response_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64 * 1024]))
            .expect(1)
            .mount(&server)
            .await;

        let mut env = environment(Duration::from_millis(5), &ManualReachability::new());
        env.transfer.default_response_size = 1024;
        env.transfer.maximum_response_size = 4096;
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/huge", &env);
        let progress = request.progress();

        let err = request.submit(&ctx).finished().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { limit: 4096 }));
        assert_eq!(progress.retry_count(), 0);
    }

    #[tokio::test]
    async fn bad_content_type_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(path("/html"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<p/>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;

        let env = environment(Duration::from_millis(5), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/html", &env).with_acceptable_content_types(["application/json"]);

        let err = request.submit(&ctx).finished().await.unwrap().unwrap_err();
        assert_eq!(err.domain_code(), Some(crate::error::CODE_BAD_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn cancel_while_waiting_stops_all_attempts() {
        let server = MockServer::start().await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let env = environment(Duration::from_secs(3600), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/down", &env);
        let progress = request.progress();
        let mut submission = request.submit(&ctx);

        wait_for_state(&progress, RetryState::WaitingToRetry).await;
        env.dispatcher.cancel(submission.id());

        assert!(submission.finished().await.is_none());
        submission.status().wait_finished().await;
        assert!(submission.status().error().unwrap().is_cancelled());
        assert_eq!(progress.retry_state(), RetryState::Finished);
        assert_eq!(progress.retry_count(), 1);

        let mut view = progress.subscribe_client_view();
        view.wait_for(|v| v.state == RetryState::Finished).await.unwrap();
        assert_eq!(env.events.subscriber_count("127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn sibling_success_short_circuits_the_wait() {
        let server = MockServer::start().await;
        Mock::given(path("/b"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(path("/b"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(path("/a"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let env = environment(Duration::from_secs(3600), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();

        let b = get(&server, "/b", &env);
        let b_progress = b.progress();
        let mut b_submission = b.submit(&ctx);
        wait_for_state(&b_progress, RetryState::WaitingToRetry).await;

        let a = get(&server, "/a", &env);
        a.submit(&ctx).finished().await.unwrap().unwrap();

        let b_result = tokio::time::timeout(Duration::from_secs(5), b_submission.finished())
            .await
            .expect("sibling success should end the wait long before the timer")
            .unwrap();
        assert!(b_result.is_ok());
        assert_eq!(b_progress.retry_count(), 1);
    }

    #[tokio::test]
    async fn host_coming_back_triggers_a_retry() {
        let server = MockServer::start().await;
        Mock::given(path("/r"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(path("/r"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reachability = ManualReachability::new();
        let env = environment(Duration::from_secs(3600), &reachability);
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/r", &env);
        let progress = request.progress();
        let mut submission = request.submit(&ctx);

        wait_for_state(&progress, RetryState::WaitingToRetry).await;
        // Let the "unreachable" half of the watch complete first
        tokio::time::sleep(Duration::from_millis(20)).await;
        reachability.set_flags("127.0.0.1", ReachabilityFlags::REACHABLE);

        let result = tokio::time::timeout(Duration::from_secs(5), submission.finished())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn already_reachable_host_does_not_retry_early() {
        let server = MockServer::start().await;
        Mock::given(path("/s"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let reachability = ManualReachability::new();
        reachability.set_flags("127.0.0.1", ReachabilityFlags::REACHABLE);
        let env = environment(Duration::from_secs(3600), &reachability);
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/s", &env);
        let progress = request.progress();
        let submission = request.submit(&ctx);

        wait_for_state(&progress, RetryState::WaitingToRetry).await;
        reachability.set_flags("127.0.0.1", ReachabilityFlags::REACHABLE | ReachabilityFlags::IS_WWAN);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(progress.retry_state(), RetryState::WaitingToRetry);

        env.dispatcher.cancel(submission.id());
        submission.status().wait_finished().await;
    }

    #[tokio::test]
    async fn response_file_receives_the_body() {
        let server = MockServer::start().await;
        Mock::given(path("/f"))
            .respond_with(ResponseTemplate::new(500).set_body_string("error page"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("body.txt");
        let env = environment(Duration::from_millis(5), &ManualReachability::new());
        let ctx = ExecutionContext::current("test").unwrap();
        let request = get(&server, "/f", &env).with_response_file(&target);
        let progress = request.progress();

        request.submit(&ctx).finished().await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "ok");
        assert_eq!(progress.response_content(), None);
    }
}
