//! Scheduling of replication conflict resolutions.
//!
//! The [`ResolverService`] runs one task per pulled conflicted document on
//! the database runtime's blocking pool and tracks them so that shutdown
//! can cancel or wait for them. State, the in-flight set and the deferred
//! shutdown callback share one lock; callbacks never run while it is held.

use crate::conflict::ConflictResolver;
use crate::database::DatabaseInner;
use crate::error::{Error, Result};
use crate::resolve;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use uuid::Uuid;

/// Lifecycle of the resolver service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    /// Shutdown requested; waiting for in-flight tasks
    Stopping,
    Stopped,
}

/// Called exactly once when a task finishes, fails or is cancelled.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

type FinishedCallback = Box<dyn FnOnce() + Send>;

/// One in-flight conflict resolution.
pub struct ResolutionTask {
    id: Uuid,
    document_id: String,
    database: Weak<DatabaseInner>,
    resolver: Arc<dyn ConflictResolver>,
    cancelled: AtomicBool,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl ResolutionTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Takes effect before the task's next attempt.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn run(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        let Some(database) = self.database.upgrade() else {
            return Err(Error::NotOpen);
        };
        resolve::resolve_pulled_conflict(
            &database,
            &self.document_id,
            self.resolver.as_ref(),
            &self.cancelled,
        )
    }

    fn complete(&self, result: Result<()>) {
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled(format!(
            "conflict resolution for document {}",
            self.document_id
        ))
    }
}

impl fmt::Debug for ResolutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionTask")
            .field("id", &self.id)
            .field("document_id", &self.document_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct ServiceInner {
    state: ServiceState,
    tasks: HashMap<Uuid, Arc<ResolutionTask>>,
    on_finished: Option<FinishedCallback>,
}

struct Shared {
    inner: Mutex<ServiceInner>,
    stopped: Condvar,
}

impl Shared {
    fn finish(&self, id: Uuid) {
        let callback = {
            let mut inner = self.inner.lock();
            inner.tasks.remove(&id);
            if inner.state == ServiceState::Stopping && inner.tasks.is_empty() {
                inner.state = ServiceState::Stopped;
                self.stopped.notify_all();
                inner.on_finished.take()
            } else {
                None
            }
        };

        if let Some(callback) = callback {
            tracing::info!("Resolver service stopped");
            callback();
        }
    }
}

/// Runs conflict resolution tasks for one database.
#[derive(Clone)]
pub struct ResolverService {
    shared: Arc<Shared>,
    handle: Handle,
}

impl fmt::Debug for ResolverService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ResolverService")
            .field("state", &inner.state)
            .field("in_flight", &inner.tasks.len())
            .finish()
    }
}

impl ResolverService {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(ServiceInner {
                    state: ServiceState::Running,
                    tasks: HashMap::new(),
                    on_finished: None,
                }),
                stopped: Condvar::new(),
            }),
            handle,
        }
    }

    /// Schedule resolution of `document_id`'s conflicts.
    ///
    /// If the service is no longer running the task is cancelled and
    /// `on_complete` runs synchronously with [`Error::Cancelled`].
    pub(crate) fn submit(
        &self,
        database: &Arc<DatabaseInner>,
        document_id: impl Into<String>,
        resolver: Arc<dyn ConflictResolver>,
        on_complete: CompletionCallback,
    ) -> Arc<ResolutionTask> {
        let task = Arc::new(ResolutionTask {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            database: Arc::downgrade(database),
            resolver,
            cancelled: AtomicBool::new(false),
            on_complete: Mutex::new(Some(on_complete)),
        });

        let accepted = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ServiceState::Running {
                inner.tasks.insert(task.id, task.clone());
                true
            } else {
                false
            }
        };

        if !accepted {
            tracing::debug!(doc_id = %task.document_id, "Resolver service not running; cancelling task");
            task.cancel();
            task.complete(Err(task.cancelled_error()));
            return task;
        }

        tracing::debug!(doc_id = %task.document_id, task = %task.id, "Conflict resolution scheduled");
        let shared = self.shared.clone();
        let running = task.clone();
        self.handle.spawn_blocking(move || {
            let result = running.run();
            if let Err(e) = &result {
                tracing::warn!(doc_id = %running.document_id, error = %e, "Conflict resolution failed");
            }
            running.complete(result);
            shared.finish(running.id);
        });
        task
    }

    /// Stop accepting tasks.
    ///
    /// With `wait`, in-flight tasks run to completion; otherwise each is
    /// cancelled before this returns. `on_finished` runs once every task
    /// has finished, immediately if none are in flight. Returns `false`,
    /// without running `on_finished`, if shutdown was already initiated.
    pub fn shutdown(&self, wait: bool, on_finished: impl FnOnce() + Send + 'static) -> bool {
        let finished_now = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ServiceState::Running {
                return false;
            }

            if inner.tasks.is_empty() {
                inner.state = ServiceState::Stopped;
                self.shared.stopped.notify_all();
                true
            } else {
                inner.state = ServiceState::Stopping;
                inner.on_finished = Some(Box::new(on_finished));
                if !wait {
                    for task in inner.tasks.values() {
                        task.cancel();
                    }
                }
                tracing::info!(
                    in_flight = inner.tasks.len(),
                    wait,
                    "Resolver service stopping"
                );
                return true;
            }
        };

        if finished_now {
            tracing::info!("Resolver service stopped");
            on_finished();
        }
        true
    }

    /// Block until the service has stopped or `timeout` elapses. Returns
    /// whether it stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while inner.state != ServiceState::Stopped {
            if self.shared.stopped.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == ServiceState::Stopped;
            }
        }
        true
    }

    pub fn state(&self) -> ServiceState {
        self.shared.inner.lock().state
    }

    /// Snapshot of tasks that have not finished yet.
    pub fn in_flight(&self) -> Vec<Arc<ResolutionTask>> {
        self.shared.inner.lock().tasks.values().cloned().collect()
    }
}
