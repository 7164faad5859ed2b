//! Single HTTP transfer as a [`Task`]

use super::auth::{
    AuthenticationChallenge, AuthenticationDelegate, ChallengeDisposition, Credential,
    MAX_CHALLENGE_ROUNDS, protection_space,
};
use super::request::{HttpRequest, ResponseMetadata, ResponsePolicy, ResponseSlot, StatusSet};
use super::sink::{BodyAccumulator, OutputSink, ResponseBody};
use crate::config::TransferConfig;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::events::HostEventBus;
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A successful transfer: final metadata plus where the body went
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status line and headers of the final response
    pub metadata: ResponseMetadata,
    /// Body destination and size
    pub body: ResponseBody,
}

/// Runs one request and collects its response
///
/// Succeeds only if the final status is in the acceptable status set and the
/// MIME type is in the acceptable content types (when those are set). The
/// status check comes first. The response metadata of the attempt is
/// available through [`HttpRequestTask::response_slot`] even when the task
/// fails.
pub struct HttpRequestTask {
    client: reqwest::Client,
    request: HttpRequest,
    policy: ResponsePolicy,
    output: Option<OutputSink>,
    default_response_size: usize,
    maximum_response_size: usize,
    delegate: Option<Arc<dyn AuthenticationDelegate>>,
    events: Option<HostEventBus>,
    slot: ResponseSlot,
    debug_delay: Option<Duration>,
    debug_error: Option<Error>,
}

impl std::fmt::Debug for HttpRequestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequestTask")
            .field("request", &self.request)
            .field("policy", &self.policy)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl HttpRequestTask {
    /// A task for `request`; body sizes come from `transfer`
    pub fn new(client: reqwest::Client, request: HttpRequest, transfer: &TransferConfig) -> Self {
        Self {
            client,
            request,
            policy: ResponsePolicy::default(),
            output: None,
            default_response_size: transfer.default_response_size,
            maximum_response_size: transfer.maximum_response_size,
            delegate: None,
            events: None,
            slot: ResponseSlot::default(),
            debug_delay: None,
            debug_error: None,
        }
    }

    /// Replace the acceptable status set (default 200–299)
    pub fn with_acceptable_statuses(mut self, statuses: StatusSet) -> Self {
        self.policy.statuses = statuses;
        self
    }

    /// Restrict acceptable MIME types
    pub fn with_acceptable_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.policy.content_types = Some(
            types
                .into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect::<HashSet<_>>(),
        );
        self
    }

    /// Replace the whole acceptance policy
    pub fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send the body to a file or writer instead of memory
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    /// Answer `401` challenges through `delegate`
    pub fn with_authentication_delegate(mut self, delegate: Arc<dyn AuthenticationDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Publish a host success on `events` when the transfer succeeds
    pub fn with_success_events(mut self, events: HostEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Sleep before sending (fault injection)
    pub fn with_debug_delay(mut self, delay: Duration) -> Self {
        self.debug_delay = Some(delay);
        self
    }

    /// Fail with `error` instead of sending (fault injection)
    pub fn with_debug_error(mut self, error: Error) -> Self {
        self.debug_error = Some(error);
        self
    }

    /// The request this task sends
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Handle to the metadata this task captures
    pub fn response_slot(&self) -> ResponseSlot {
        self.slot.clone()
    }

    /// Send, answering authentication challenges, until a final response
    async fn send(&self) -> Result<reqwest::Response> {
        let mut credential: Option<Credential> = None;
        let mut rounds = 0;

        loop {
            let mut builder = self.request.to_builder(&self.client);
            if let Some(credential) = &credential {
                builder = credential.apply(builder);
            }
            let response = builder.send().await?;

            let Some(delegate) = &self.delegate else {
                return Ok(response);
            };
            let Some(space) = protection_space(response.url(), response.status(), response.headers())
            else {
                return Ok(response);
            };
            if rounds >= MAX_CHALLENGE_ROUNDS {
                warn!(url = %self.request.url(), rounds, "giving up on authentication challenge");
                return Ok(response);
            }
            if !delegate.can_authenticate(&space) {
                debug!(host = %space.host, scheme = %space.scheme, "delegate declined protection space");
                return Ok(response);
            }

            let challenge = AuthenticationChallenge {
                protection_space: space,
                previous_failure_count: rounds,
                failure_response: ResponseMetadata::from_response(&response),
            };
            match delegate.handle_challenge(&challenge).await {
                ChallengeDisposition::UseCredential(next) => {
                    debug!(url = %self.request.url(), round = rounds + 1, "answering authentication challenge");
                    credential = Some(next);
                    rounds += 1;
                }
                ChallengeDisposition::Reject => return Ok(response),
            }
        }
    }
}

#[async_trait]
impl Task for HttpRequestTask {
    type Output = HttpResponse;

    fn describe(&self) -> String {
        format!("{} {}", self.request.method(), self.request.url())
    }

    async fn execute(&mut self, _context: &ExecutionContext) -> Result<HttpResponse> {
        if let Some(delay) = self.debug_delay {
            debug!(url = %self.request.url(), delay_ms = delay.as_millis() as u64, "debug delay");
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.debug_error.clone() {
            debug!(url = %self.request.url(), error = %error, "debug error");
            return Err(error);
        }

        let mut response = self.send().await?;
        let metadata = ResponseMetadata::from_response(&response);
        self.slot.capture(metadata.clone());
        debug!(
            url = %metadata.url,
            status = metadata.status.as_u16(),
            content_type = ?metadata.mime_type,
            content_length = ?metadata.content_length,
            "received response headers"
        );

        let mut accumulator: Option<BodyAccumulator> = None;
        while let Some(chunk) = response.chunk().await? {
            if chunk.is_empty() {
                continue;
            }
            if accumulator.is_none() {
                let output = self.output.take().unwrap_or(OutputSink::Memory {
                    default_size: self.default_response_size,
                    maximum_size: self.maximum_response_size,
                });
                accumulator = Some(BodyAccumulator::open(output, metadata.content_length).await?);
            }
            if let Some(sink) = accumulator.as_mut() {
                sink.append(&chunk).await?;
            }
        }
        let body = match accumulator {
            Some(sink) => sink.finish().await?,
            None => ResponseBody::Empty,
        };

        self.policy.check(&metadata)?;

        if let Some(events) = &self.events {
            events.publish(self.request.host());
        }
        Ok(HttpResponse { metadata, body })
    }
}
