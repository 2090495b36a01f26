//! Registry of active processes.
//!
//! Live queries and running replicators register here so that closing a
//! database can stop them and wait until they have all wound down.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Something that keeps the database busy until stopped.
pub(crate) trait ActiveProcess: Send + Sync {
    /// Ask the process to stop. It deregisters itself once it has.
    fn stop(&self);

    fn describe(&self) -> String;
}

/// Processes are held weakly; a dropped process counts as stopped.
#[derive(Default)]
pub(crate) struct ActiveProcesses {
    processes: Mutex<HashMap<Uuid, Weak<dyn ActiveProcess>>>,
    idle: Condvar,
}

impl ActiveProcesses {
    pub(crate) fn register(&self, id: Uuid, process: Weak<dyn ActiveProcess>) {
        self.processes.lock().insert(id, process);
        tracing::debug!(process = %id, "Active process registered");
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        let mut processes = self.processes.lock();
        if processes.remove(&id).is_some() {
            tracing::debug!(process = %id, "Active process deregistered");
        }
        if processes.values().all(|p| p.strong_count() == 0) {
            self.idle.notify_all();
        }
    }

    /// Number of registered processes still alive.
    pub(crate) fn count(&self) -> usize {
        self.processes
            .lock()
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Ask every live process to stop. `stop` runs without the registry
    /// lock held since processes deregister from inside it.
    pub(crate) fn stop_all(&self) {
        let live: Vec<Arc<dyn ActiveProcess>> = {
            let mut processes = self.processes.lock();
            processes.retain(|_, p| p.strong_count() > 0);
            processes.values().filter_map(Weak::upgrade).collect()
        };

        for process in live {
            tracing::info!(process = %process.describe(), "Stopping active process");
            process.stop();
        }
    }

    /// Wait for every process to deregister, checking up to `retries` times
    /// and waiting at most `timeout` between checks.
    pub(crate) fn wait_idle(&self, retries: u32, timeout: Duration) -> Result<()> {
        let mut processes = self.processes.lock();
        for attempt in 0..=retries {
            processes.retain(|_, p| p.strong_count() > 0);
            if processes.is_empty() {
                return Ok(());
            }
            if attempt == retries {
                break;
            }
            tracing::debug!(
                remaining = processes.len(),
                attempt = attempt + 1,
                "Waiting for active processes to stop"
            );
            self.idle.wait_for(&mut processes, timeout);
        }

        // Released before the upgraded handles drop: a last reference
        // dropping here would deregister and re-enter the lock.
        let live: Vec<Arc<dyn ActiveProcess>> =
            processes.values().filter_map(Weak::upgrade).collect();
        drop(processes);

        let names: Vec<String> = live.iter().map(|p| p.describe()).collect();
        Err(Error::Busy(format!(
            "{} active process(es) did not stop: {}",
            names.len(),
            names.join(", ")
        )))
    }
}
