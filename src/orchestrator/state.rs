//! Retry state and its client-facing mirror

use crate::context::ExecutionContext;
use crate::http::{HttpResponse, ResponseBody, ResponseMetadata};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Where a retrying request is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryState {
    /// Not started yet
    NotStarted,
    /// First attempt in flight
    Attempting,
    /// Last attempt failed with a retryable error; waiting for a trigger
    WaitingToRetry,
    /// A later attempt is in flight
    Retrying,
    /// Done, successfully or not
    Finished,
}

impl std::fmt::Display for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RetryState::NotStarted => "not-started",
            RetryState::Attempting => "attempting",
            RetryState::WaitingToRetry => "waiting-to-retry",
            RetryState::Retrying => "retrying",
            RetryState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// What the client context sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientView {
    /// Mirror of the retry state
    pub state: RetryState,
    /// True once any attempt failed with a retryable error
    pub has_had_retryable_failure: bool,
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            state: RetryState::NotStarted,
            has_had_retryable_failure: false,
        }
    }
}

#[derive(Default)]
struct Outcome {
    response: Option<ResponseMetadata>,
    body: Option<ResponseBody>,
}

struct ClientMirror {
    issued: u64,
    view: ClientView,
}

struct ProgressInner {
    sequence: u64,
    client_context: ExecutionContext,
    state: watch::Sender<RetryState>,
    transitions: Mutex<Vec<RetryState>>,
    retry_count: AtomicU32,
    outcome: Mutex<Outcome>,
    pending_client: Mutex<ClientMirror>,
    applied_client: AtomicU64,
    client: watch::Sender<ClientView>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observable progress of one retrying request
///
/// Internal state and retry count change on the orchestrator's context; the
/// [`ClientView`] only ever changes on the client context, so code running
/// there can read it without hopping contexts. Everything here can be read
/// from any thread.
#[derive(Clone)]
pub struct RetryProgress {
    inner: Arc<ProgressInner>,
}

impl std::fmt::Debug for RetryProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProgress")
            .field("sequence", &self.inner.sequence)
            .field("state", &self.retry_state())
            .field("retry_count", &self.retry_count())
            .field("client", &self.client_view())
            .finish()
    }
}

impl RetryProgress {
    pub(crate) fn new(sequence: u64, client_context: ExecutionContext) -> Self {
        let (state, _) = watch::channel(RetryState::NotStarted);
        let (client, _) = watch::channel(ClientView::default());
        Self {
            inner: Arc::new(ProgressInner {
                sequence,
                client_context,
                state,
                transitions: Mutex::new(vec![RetryState::NotStarted]),
                retry_count: AtomicU32::new(0),
                outcome: Mutex::new(Outcome::default()),
                pending_client: Mutex::new(ClientMirror {
                    issued: 0,
                    view: ClientView::default(),
                }),
                applied_client: AtomicU64::new(0),
                client,
            }),
        }
    }

    /// Process-unique number of the request, used in log lines
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Internal retry state
    pub fn retry_state(&self) -> RetryState {
        *self.inner.state.borrow()
    }

    /// Observe the internal retry state
    pub fn subscribe_retry_state(&self) -> watch::Receiver<RetryState> {
        self.inner.state.subscribe()
    }

    /// Every internal state the request went through, in order
    pub fn transitions(&self) -> Vec<RetryState> {
        lock(&self.inner.transitions).clone()
    }

    /// Retryable failures so far
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::Acquire)
    }

    /// Client-context view
    pub fn client_view(&self) -> ClientView {
        *self.inner.client.borrow()
    }

    /// Mirrored retry state, as last seen on the client context
    pub fn client_retry_state(&self) -> RetryState {
        self.client_view().state
    }

    /// True once the client context learned of a retryable failure
    pub fn has_had_retryable_failure(&self) -> bool {
        self.client_view().has_had_retryable_failure
    }

    /// Observe the client view
    pub fn subscribe_client_view(&self) -> watch::Receiver<ClientView> {
        self.inner.client.subscribe()
    }

    /// Metadata of the last attempt that received a response
    pub fn response(&self) -> Option<ResponseMetadata> {
        lock(&self.inner.outcome).response.clone()
    }

    /// MIME type of the final response
    pub fn response_mime_type(&self) -> Option<String> {
        lock(&self.inner.outcome)
            .response
            .as_ref()
            .and_then(|r| r.mime_type.clone())
    }

    /// Where the successful body went
    pub fn response_body(&self) -> Option<ResponseBody> {
        lock(&self.inner.outcome).body.clone()
    }

    /// Successful body bytes; `None` if the body went to a file
    pub fn response_content(&self) -> Option<Vec<u8>> {
        match lock(&self.inner.outcome).body.as_ref()? {
            ResponseBody::Memory(bytes) => Some(bytes.clone()),
            ResponseBody::Empty => Some(Vec::new()),
            ResponseBody::File { .. } | ResponseBody::Writer { .. } => None,
        }
    }

    pub(crate) fn set_state(&self, state: RetryState) -> bool {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state || *current == RetryState::Finished {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            lock(&self.inner.transitions).push(state);
            tracing::debug!(request = self.inner.sequence, state = %state, "retry state changed");
            self.mirror(|view| view.state = state);
        }
        changed
    }

    pub(crate) fn record_retryable_failure(&self) -> u32 {
        let count = self.inner.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.mirror(|view| view.has_had_retryable_failure = true);
        count
    }

    pub(crate) fn record_response(&self, metadata: ResponseMetadata) {
        lock(&self.inner.outcome).response = Some(metadata);
    }

    pub(crate) fn record_success(&self, response: &HttpResponse) {
        let mut outcome = lock(&self.inner.outcome);
        outcome.response = Some(response.metadata.clone());
        outcome.body = Some(response.body.clone());
    }

    /// Queue `update` for the client context
    ///
    /// Snapshots carry an increasing number; an older snapshot arriving
    /// after a newer one is dropped.
    fn mirror(&self, update: impl FnOnce(&mut ClientView)) {
        let (issued, view) = {
            let mut pending = lock(&self.inner.pending_client);
            update(&mut pending.view);
            pending.issued += 1;
            (pending.issued, pending.view)
        };
        let inner = self.inner.clone();
        self.inner.client_context.post(move || {
            if inner.applied_client.load(Ordering::Acquire) >= issued {
                return;
            }
            inner.applied_client.store(issued, Ordering::Release);
            inner.client.send_if_modified(|current| {
                let changed = *current != view;
                *current = view;
                changed
            });
        });
    }
}
