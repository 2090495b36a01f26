//! Serial delivery of listener callbacks.
//!
//! Every notification a database produces (database and document changes,
//! live-query results, replicator status and document events) is posted
//! here. Jobs run one at a time, in posting order, on the blocking pool so
//! a slow listener never stalls the async workers.

use crate::executor::Executor;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Sender half of the delivery queue.
pub(crate) struct DeliveryQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl DeliveryQueue {
    /// Spawn the delivery task on the database runtime.
    pub(crate) fn start(executor: &Executor) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let handle = executor.handle().clone();

        executor.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(e) = handle.spawn_blocking(job).await {
                    tracing::warn!(error = %e, "Listener callback panicked");
                }
            }
            tracing::debug!("Delivery queue closed");
        });

        Self { sender }
    }

    /// Queue a job behind everything posted before it.
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::debug!("Delivery queue stopped; dropping notification");
        }
    }

    /// Block until every job posted so far has run. Returns `false` if that
    /// takes longer than `timeout`; called from a listener it always does.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (done, caught_up) = std_mpsc::sync_channel(1);
        self.post(move || {
            let _ = done.send(());
        });
        caught_up.recv_timeout(timeout).is_ok()
    }
}
