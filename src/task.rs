//! Context-pinned asynchronous tasks
//!
//! A [`Task`] is a unit of asynchronous work with a three-state lifecycle
//! (see [`TaskState`]). The driver runs it on exactly one
//! [`ExecutionContext`]:
//!
//! 1. `Inited -> Executing`, then [`Task::on_start`]
//! 2. [`Task::execute`] raced against the cancellation token
//! 3. [`Task::on_will_finish`], always, even after cancellation
//! 4. the terminal error is published and the state becomes `Finished`
//!
//! State and error can be read from any thread through [`TaskStatus`]; they
//! are only written by the driver, on the task's own context.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, not yet started
    Inited,
    /// Started and running on its context
    Executing,
    /// Done; the error (if any) is final
    Finished,
}

/// An asynchronous unit of work driven by [`spawn_task`] or the [`crate::Dispatcher`]
#[async_trait]
pub trait Task: Send + 'static {
    /// Value produced on success
    type Output: Send + 'static;

    /// Short label used in log lines
    fn describe(&self) -> String;

    /// Setup hook, called on the task's context right after it starts
    ///
    /// Returning an error finishes the task immediately with that error.
    async fn on_start(&mut self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Task body; dropped at its next await point if the task is cancelled
    async fn execute(&mut self, context: &ExecutionContext) -> Result<Self::Output>;

    /// Teardown hook, always called before the task is marked finished
    ///
    /// `error` is `Some(Error::Cancelled)` after a cancellation.
    async fn on_will_finish(&mut self, _error: Option<&Error>) {}
}

struct Lifecycle {
    label: String,
    context: ExecutionContext,
    state: watch::Sender<TaskState>,
    error: Mutex<Option<Error>>,
    cancel: CancellationToken,
}

impl Lifecycle {
    fn start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TaskState::Inited {
                *state = TaskState::Executing;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, error: Option<Error>) -> bool {
        if *self.state.borrow() != TaskState::Executing {
            return false;
        }
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
        self.state.send_replace(TaskState::Finished);
        true
    }
}

/// Read-only, cloneable view of a task's lifecycle
///
/// All methods are safe to call from any thread.
#[derive(Clone)]
pub struct TaskStatus {
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStatus")
            .field("label", &self.lifecycle.label)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskStatus {
    pub(crate) fn new(label: String, context: ExecutionContext) -> Self {
        let (state, _) = watch::channel(TaskState::Inited);
        Self {
            lifecycle: Arc::new(Lifecycle {
                label,
                context,
                state,
                error: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        *self.lifecycle.state.borrow()
    }

    /// True once the task reached `Finished`
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Terminal error; only meaningful once finished
    pub fn error(&self) -> Option<Error> {
        self.lifecycle
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Context the task is pinned to
    pub fn context(&self) -> &ExecutionContext {
        &self.lifecycle.context
    }

    /// Label given by [`Task::describe`]
    pub fn label(&self) -> &str {
        &self.lifecycle.label
    }

    /// Request cooperative termination
    ///
    /// Safe from any thread in any state; a no-op once finished.
    pub fn cancel(&self) {
        if !self.is_finished() {
            self.lifecycle.cancel.cancel();
        }
    }

    /// True if cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.lifecycle.cancel.is_cancelled()
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<TaskState> {
        self.lifecycle.state.subscribe()
    }

    /// Wait until the task is finished
    pub async fn wait_finished(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|state| *state == TaskState::Finished).await;
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.lifecycle.cancel
    }

    #[cfg(test)]
    pub(crate) fn force_start(&self) -> bool {
        self.lifecycle.start()
    }

    #[cfg(test)]
    pub(crate) fn force_finish(&self, error: Option<Error>) -> bool {
        self.lifecycle.finish(error)
    }
}

/// Owning handle of a spawned task
pub struct TaskHandle<O> {
    status: TaskStatus,
    join: JoinHandle<Result<O>>,
}

impl<O> TaskHandle<O> {
    /// Lifecycle view of the task
    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// Request cooperative termination
    pub fn cancel(&self) {
        self.status.cancel();
    }

    /// Wait for the task and take its result
    pub async fn join(self) -> Result<O> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Other(format!("task panicked: {e}"))),
        }
    }
}

/// Run `task` on `context`, returning its handle
pub fn spawn_task<T: Task>(task: T, context: &ExecutionContext) -> TaskHandle<T::Output> {
    let status = TaskStatus::new(task.describe(), context.clone());
    let join = context.spawn(drive(task, status.clone()));
    TaskHandle { status, join }
}

/// Drive `task` through its lifecycle; must run on the status' context
pub(crate) async fn drive<T: Task>(mut task: T, status: TaskStatus) -> Result<T::Output> {
    let lifecycle = status.lifecycle.clone();
    let context = lifecycle.context.clone();

    if !lifecycle.start() {
        return Err(Error::Other(format!(
            "task {} was started twice",
            lifecycle.label
        )));
    }
    tracing::debug!(task = %lifecycle.label, context = %context.name(), "task started");

    let result = if lifecycle.cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        let body = async {
            task.on_start(&context).await?;
            task.execute(&context).await
        };
        tokio::select! {
            biased;
            _ = lifecycle.cancel.cancelled() => Err(Error::Cancelled),
            result = body => result,
        }
    };

    task.on_will_finish(result.as_ref().err()).await;
    lifecycle.finish(result.as_ref().err().cloned());

    match &result {
        Ok(_) => tracing::debug!(task = %lifecycle.label, "task finished"),
        Err(e) if e.is_cancelled() => tracing::debug!(task = %lifecycle.label, "task cancelled"),
        Err(e) => tracing::debug!(task = %lifecycle.label, error = %e, "task failed"),
    }

    result
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Sleeper {
        duration: Duration,
        will_finish_called: Arc<AtomicBool>,
        seen_error: Arc<Mutex<Option<Error>>>,
    }

    #[async_trait]
    impl Task for Sleeper {
        type Output = u32;

        fn describe(&self) -> String {
            "sleeper".into()
        }

        async fn execute(&mut self, _context: &ExecutionContext) -> Result<u32> {
            tokio::time::sleep(self.duration).await;
            Ok(7)
        }

        async fn on_will_finish(&mut self, error: Option<&Error>) {
            self.will_finish_called.store(true, Ordering::SeqCst);
            *self.seen_error.lock().unwrap() = error.cloned();
        }
    }

    fn sleeper(duration: Duration) -> (Sleeper, Arc<AtomicBool>, Arc<Mutex<Option<Error>>>) {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(None));
        (
            Sleeper {
                duration,
                will_finish_called: flag.clone(),
                seen_error: seen.clone(),
            },
            flag,
            seen,
        )
    }

    struct FailsOnStart;

    #[async_trait]
    impl Task for FailsOnStart {
        type Output = ();

        fn describe(&self) -> String {
            "fails-on-start".into()
        }

        async fn on_start(&mut self, _context: &ExecutionContext) -> Result<()> {
            Err(Error::InvalidRequest("no host".into()))
        }

        async fn execute(&mut self, _context: &ExecutionContext) -> Result<()> {
            panic!("execute must not run when on_start fails");
        }
    }

    struct RecordsContext;

    #[async_trait]
    impl Task for RecordsContext {
        type Output = bool;

        fn describe(&self) -> String {
            "records-context".into()
        }

        async fn execute(&mut self, context: &ExecutionContext) -> Result<bool> {
            Ok(context.is_current())
        }
    }

    #[tokio::test]
    async fn successful_task_walks_all_states() {
        let ctx = ExecutionContext::current("test").unwrap();
        let (task, will_finish, _) = sleeper(Duration::from_millis(5));

        let handle = spawn_task(task, &ctx);
        let mut states = handle.status().subscribe_state();
        assert_eq!(*states.borrow(), TaskState::Inited);

        let status = handle.status().clone();
        assert_eq!(handle.join().await.unwrap(), 7);
        assert_eq!(status.state(), TaskState::Finished);
        assert!(status.error().is_none());
        assert!(will_finish.load(Ordering::SeqCst));
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn cancel_finishes_with_cancellation_and_runs_teardown() {
        let ctx = ExecutionContext::current("test").unwrap();
        let (task, will_finish, seen) = sleeper(Duration::from_secs(60));

        let handle = spawn_task(task, &ctx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let status = handle.status().clone();
        assert!(matches!(handle.join().await, Err(Error::Cancelled)));
        assert!(status.error().unwrap().is_cancelled());
        assert!(will_finish.load(Ordering::SeqCst));
        assert!(seen.lock().unwrap().as_ref().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_before_start_still_passes_through_executing() {
        let ctx = ExecutionContext::current("test").unwrap();
        let (task, will_finish, _) = sleeper(Duration::from_secs(60));
        let status = TaskStatus::new("queued".into(), ctx.clone());
        let mut states = status.subscribe_state();
        status.cancel();

        let result = drive(task, status.clone()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(will_finish.load(Ordering::SeqCst));
        assert_eq!(status.state(), TaskState::Finished);
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn on_start_failure_finishes_immediately() {
        let ctx = ExecutionContext::current("test").unwrap();
        let handle = spawn_task(FailsOnStart, &ctx);
        let status = handle.status().clone();
        assert!(matches!(
            handle.join().await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(status.error(), Some(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn execute_runs_on_the_task_context() {
        let ctx = ExecutionContext::dedicated("task-loop").unwrap();
        assert!(spawn_task(RecordsContext, &ctx).join().await.unwrap());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let ctx = ExecutionContext::current("test").unwrap();
        let status = TaskStatus::new("manual".into(), ctx);

        assert!(!status.force_finish(None), "cannot finish before executing");
        assert!(status.force_start());
        assert!(!status.force_start(), "no back edge to Executing");
        assert!(status.force_finish(Some(Error::Status { code: 500 })));
        assert!(!status.force_finish(None));
        assert!(!status.force_finish(Some(Error::Cancelled)));

        assert_eq!(status.state(), TaskState::Finished);
        assert_eq!(status.error().and_then(|e| e.status_code()), Some(500));
    }

    #[tokio::test]
    async fn cancelling_a_finished_task_is_a_no_op() {
        let ctx = ExecutionContext::current("test").unwrap();
        let (task, _, _) = sleeper(Duration::from_millis(1));
        let handle = spawn_task(task, &ctx);
        let status = handle.status().clone();
        handle.join().await.unwrap();

        status.cancel();
        assert!(!status.is_cancel_requested());
        assert!(status.error().is_none());
        assert_eq!(status.state(), TaskState::Finished);
    }
}
