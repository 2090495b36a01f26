//! Shared fixtures for integration tests.

#![allow(dead_code)]

use harbor::{
    ActivityLevel, Database, DatabaseConfig, Document, MemoryStore, ReplicationEngine,
    ReplicatorCallbacks, ReplicatorStatus, Result,
};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn open(name: &str) -> Database {
    harbor::telemetry::init();
    Database::open_in_memory(name).unwrap()
}

pub fn open_with(config: DatabaseConfig) -> Database {
    harbor::telemetry::init();
    Database::open(MemoryStore::new(config.name.clone()), config).unwrap()
}

/// Save `local` under `id`, then record a pulled revision with body
/// `remote` that does not descend from it.
pub fn make_conflict(db: &Database, id: &str, local: Value, remote: Value) -> Document {
    let mut doc = Document::with_body(id, local);
    db.save(&mut doc).unwrap();
    db.with_storage(|store| store.insert_remote_revision(id, remote, false, None))
        .unwrap()
        .unwrap();
    doc
}

/// True once the document has no unresolved conflicting branch.
pub fn conflict_resolved(db: &Database, id: &str) -> bool {
    db.with_storage(|store| store.next_conflicting_revision(id))
        .unwrap()
        .unwrap()
        .is_none()
}

/// Poll `condition` until it holds or the test timeout elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A one-shot latch that blocks callers until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Callers that have reached the gate so far.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Replication engine driven by the test through its callbacks.
pub struct ManualEngine {
    callbacks: Mutex<Option<ReplicatorCallbacks>>,
    honors_stop: bool,
}

impl ManualEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(None),
            honors_stop: true,
        })
    }

    /// An engine that never reports stopping.
    pub fn unresponsive() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(None),
            honors_stop: false,
        })
    }

    pub fn callbacks(&self) -> ReplicatorCallbacks {
        self.callbacks
            .lock()
            .clone()
            .expect("engine has not been started")
    }
}

impl ReplicationEngine for ManualEngine {
    fn start(&self, callbacks: ReplicatorCallbacks) -> Result<()> {
        *self.callbacks.lock() = Some(callbacks);
        Ok(())
    }

    fn stop(&self) {
        if !self.honors_stop {
            return;
        }
        if let Some(callbacks) = self.callbacks.lock().as_ref() {
            callbacks.status_changed(ReplicatorStatus::new(ActivityLevel::Stopped));
        }
    }
}
