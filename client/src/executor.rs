//! The per-database tokio runtime.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};

/// Owns the runtime that runs a database's background work: change
/// dispatch, listener delivery, live-query refreshes and conflict
/// resolution.
///
/// Background tasks may hold the last strong reference to the database, so
/// the runtime is shut down without blocking rather than dropped in place.
pub(crate) struct Executor {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl Executor {
    pub(crate) fn new(config: &DatabaseConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(format!("harbor-{}", config.name))
            .enable_time()
            .build()
            .map_err(|e| Error::Unexpected(format!("failed to start runtime: {e}")))?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Stop the runtime. Queued work that has not started is dropped.
    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("Database runtime shut down");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
