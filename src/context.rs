//! Serial execution contexts
//!
//! An [`ExecutionContext`] is the thread/loop a task is pinned to for its
//! whole lifetime. It wraps a tokio runtime handle; everything spawned
//! through it is tagged with the context's identity so code can ask
//! [`ExecutionContext::is_current`].
//!
//! There is no implicit default context: every task receives its context as a
//! constructor or submit argument.
//!
//! Two flavours exist:
//! - [`ExecutionContext::from_handle`] / [`ExecutionContext::current`] borrow an
//!   existing runtime. On a current-thread runtime this is already serial.
//! - [`ExecutionContext::dedicated`] owns a single-threaded runtime driven by
//!   its own OS thread, so every callback of every task pinned to it runs on
//!   that one thread, one at a time.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_CONTEXT: u64;
}

/// A named, cloneable handle to a serial execution context
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl ExecutionContext {
    /// Wrap an existing runtime handle
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                handle,
                shutdown: None,
            }),
        }
    }

    /// Wrap the runtime the caller is running on
    pub fn current(name: impl Into<String>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Other(format!("no tokio runtime for execution context: {e}")))?;
        Ok(Self::from_handle(name, handle))
    }

    /// Start a single-threaded runtime on a new OS thread named `name`
    ///
    /// The thread exits once the last clone of the context is dropped.
    pub fn dedicated(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })?;

        tracing::debug!(context = %name, "started dedicated execution context");

        Ok(Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name,
                handle,
                shutdown: Some(shutdown_tx),
            }),
        })
    }

    /// Human-readable context name (used in logs)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// True when called from a future spawned through this context
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// True if both handles name the same context
    pub fn same_as(&self, other: &ExecutionContext) -> bool {
        self.inner.id == other.inner.id
    }

    /// Run a future on this context
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner
            .handle
            .spawn(CURRENT_CONTEXT.scope(self.inner.id, future))
    }

    /// Run a closure on this context, after everything posted before it
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.spawn(async move { f() }));
    }
}
