//! Bounded worker queues for tasks
//!
//! The [`Dispatcher`] separates work into three independent queues:
//! - **management** — unbounded width; reachability watches and orchestrators,
//!   which consume almost no real resources
//! - **transfer** — bounded width; the total number of network transfers in
//!   flight system-wide
//! - **compute** — default width (one per available core)
//!
//! A submitted task runs on the context it is submitted with; its completion
//! is delivered through the *submitting* context. Cancelling through
//! [`Dispatcher::cancel`] on that same context guarantees the completion
//! never fires afterwards: the delivery step and the cancel are serialized on
//! the submitting context and both go through the pending-submission table.

use crate::config::DispatcherConfig;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::task::{Task, TaskStatus, drive};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Queue a task is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Unbounded; orchestration and reachability
    Management,
    /// Bounded; network transfers
    Transfer,
    /// Default width; CPU work
    Compute,
}

/// Identity of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionId(u64);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct DispatcherInner {
    transfer: Arc<Semaphore>,
    transfer_width: usize,
    compute: Arc<Semaphore>,
    compute_width: usize,
    next_id: AtomicU64,
    pending: Mutex<HashMap<SubmissionId, TaskStatus>>,
    running_transfers: watch::Sender<usize>,
}

impl DispatcherInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<SubmissionId, TaskStatus>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn admit(
        &self,
        queue: QueueKind,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = match queue {
            QueueKind::Management => return None,
            QueueKind::Transfer => self.transfer.clone(),
            QueueKind::Compute => self.compute.clone(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }
}

/// Owner of the management, transfer and compute queues
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transfer_width", &self.inner.transfer_width)
            .field("compute_width", &self.inner.compute_width)
            .field("pending", &self.inner.pending().len())
            .finish()
    }
}

/// A submitted task whose completion can be awaited
pub struct Submission<O> {
    id: SubmissionId,
    status: TaskStatus,
    completion: oneshot::Receiver<Result<O>>,
}

impl<O> Submission<O> {
    /// Identity used with [`Dispatcher::cancel`]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Lifecycle view of the submitted task
    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// Wait for the completion
    ///
    /// Returns `None` if the submission was cancelled through the dispatcher
    /// before its completion was delivered.
    pub async fn finished(&mut self) -> Option<Result<O>> {
        (&mut self.completion).await.ok()
    }
}

impl Dispatcher {
    /// Create the queues described by `config`
    pub fn new(config: &DispatcherConfig) -> Result<Self> {
        if config.transfer_width == 0 {
            return Err(Error::config(
                "transfer queue width must be at least 1",
                "dispatcher.transfer_width",
            ));
        }
        let compute_width = match config.compute_width {
            Some(0) => {
                return Err(Error::config(
                    "compute queue width must be at least 1",
                    "dispatcher.compute_width",
                ));
            }
            Some(width) => width,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };
        let (running_transfers, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                transfer: Arc::new(Semaphore::new(config.transfer_width)),
                transfer_width: config.transfer_width,
                compute: Arc::new(Semaphore::new(compute_width)),
                compute_width,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                running_transfers,
            }),
        })
    }

    /// Width of `queue`; `None` means unbounded
    pub fn queue_width(&self, queue: QueueKind) -> Option<usize> {
        match queue {
            QueueKind::Management => None,
            QueueKind::Transfer => Some(self.inner.transfer_width),
            QueueKind::Compute => Some(self.inner.compute_width),
        }
    }

    /// Submit `task` to `queue` and await its completion through a [`Submission`]
    ///
    /// The task runs on `run_on`; the completion is handed over on `deliver_on`.
    pub fn submit<T: Task>(
        &self,
        queue: QueueKind,
        task: T,
        run_on: &ExecutionContext,
        deliver_on: &ExecutionContext,
    ) -> Submission<T::Output> {
        let (tx, completion) = oneshot::channel();
        let (id, status) = self.submit_inner(queue, task, run_on, deliver_on, move |result| {
            let _ = tx.send(result);
        });
        Submission {
            id,
            status,
            completion,
        }
    }

    /// Submit `task` to `queue`; `on_complete` runs on `deliver_on`
    ///
    /// `on_complete` is not called if the submission is cancelled first.
    pub fn submit_with<T, F>(
        &self,
        queue: QueueKind,
        task: T,
        run_on: &ExecutionContext,
        deliver_on: &ExecutionContext,
        on_complete: F,
    ) -> SubmissionId
    where
        T: Task,
        F: FnOnce(Result<T::Output>) + Send + 'static,
    {
        self.submit_inner(queue, task, run_on, deliver_on, on_complete)
            .0
    }

    fn submit_inner<T, F>(
        &self,
        queue: QueueKind,
        task: T,
        run_on: &ExecutionContext,
        deliver_on: &ExecutionContext,
        on_complete: F,
    ) -> (SubmissionId, TaskStatus)
    where
        T: Task,
        F: FnOnce(Result<T::Output>) + Send + 'static,
    {
        let id = SubmissionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let status = TaskStatus::new(task.describe(), run_on.clone());
        self.inner.pending().insert(id, status.clone());

        tracing::debug!(
            submission = %id,
            task = %status.label(),
            queue = ?queue,
            context = %run_on.name(),
            "task submitted"
        );

        let inner = self.inner.clone();
        let deliver_on = deliver_on.clone();
        let task_status = status.clone();
        drop(run_on.spawn(async move {
            let permit = inner.admit(queue, task_status.cancellation()).await;
            let counted = queue == QueueKind::Transfer && permit.is_some();
            if counted {
                inner.running_transfers.send_modify(|n| *n += 1);
            }

            let result = drive(task, task_status).await;

            drop(permit);
            if counted {
                inner.running_transfers.send_modify(|n| *n = n.saturating_sub(1));
            }

            deliver_on.post(move || {
                if inner.pending().remove(&id).is_some() {
                    on_complete(result);
                }
            });
        }));

        (id, status)
    }

    /// Cancel a submission
    ///
    /// A no-op if `id` is unknown or already completed. When called on the
    /// submission's delivery context, the completion never fires after this
    /// returns.
    pub fn cancel(&self, id: SubmissionId) {
        let status = self.inner.pending().remove(&id);
        if let Some(status) = status {
            tracing::debug!(submission = %id, task = %status.label(), "submission cancelled");
            status.cancel();
        }
    }

    /// True while the submission's completion has not been delivered or cancelled
    pub fn is_pending(&self, id: SubmissionId) -> bool {
        self.inner.pending().contains_key(&id)
    }

    /// Number of transfer-queue tasks currently running
    pub fn running_transfers(&self) -> usize {
        *self.inner.running_transfers.borrow()
    }

    /// True if any network transfer is running
    pub fn network_in_use(&self) -> bool {
        self.running_transfers() > 0
    }

    /// Observe the running-transfer count
    pub fn subscribe_network_in_use(&self) -> watch::Receiver<usize> {
        self.inner.running_transfers.subscribe()
    }
}
