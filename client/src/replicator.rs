//! Replicator front end.
//!
//! A [`ReplicationEngine`] does the network work and reports back through
//! [`ReplicatorCallbacks`]. Callbacks only enqueue a message; one dispatcher
//! task per replicator consumes them in order and owns the bookkeeping that
//! keeps status changes and document events consistent:
//!
//! - pulled documents flagged as conflicted are handed to the database's
//!   resolver service, and their document-ended event is held back until
//!   the resolution finishes;
//! - while any resolution is outstanding, status changes are queued and
//!   replayed in order once the last one finishes, after its
//!   document-ended event.
//!
//! Listeners are invoked on the database's delivery queue.

use crate::active::ActiveProcess;
use crate::conflict::{ConflictResolver, DefaultConflictResolver};
use crate::database::{Database, DatabaseInner};
use crate::error::{Error, Result};
use crate::notifier::ListenerToken;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Replicator activity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityLevel {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
}

/// Replication progress in abstract units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

/// A replicator status report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorStatus {
    pub activity: ActivityLevel,
    pub progress: Progress,
    pub error: Option<Error>,
    /// When the engine reported the status
    pub captured_at: DateTime<Utc>,
}

impl ReplicatorStatus {
    pub fn new(activity: ActivityLevel) -> Self {
        Self {
            activity,
            progress: Progress::default(),
            error: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_progress(mut self, completed: u64, total: u64) -> Self {
        self.progress = Progress { completed, total };
        self
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// Flags reported with a replicated document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFlags {
    pub deleted: bool,
    pub access_removed: bool,
}

/// A document the engine finished pushing or pulling.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEnded {
    pub id: String,
    pub flags: DocumentFlags,
    pub error: Option<Error>,
    /// Pulled revision conflicts with local history
    pub conflicted: bool,
}

impl DocumentEnded {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flags: DocumentFlags::default(),
            error: None,
            conflicted: false,
        }
    }

    pub fn conflicted(id: impl Into<String>) -> Self {
        Self {
            conflicted: true,
            ..Self::new(id)
        }
    }
}

/// Documents delivered to document listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReplication {
    pub pushing: bool,
    pub documents: Vec<DocumentEnded>,
}

/// The network side of replication.
pub trait ReplicationEngine: Send + Sync {
    /// Begin replicating, reporting through `callbacks`. The engine must
    /// eventually report [`ActivityLevel::Stopped`] after [`Self::stop`].
    fn start(&self, callbacks: ReplicatorCallbacks) -> Result<()>;

    fn stop(&self);
}

enum ReplicatorEvent {
    Status(ReplicatorStatus),
    DocumentsEnded {
        pushing: bool,
        documents: Vec<DocumentEnded>,
    },
    ConflictResolved(DocumentEnded),
}

/// Handle through which an engine reports to its replicator. Cheap to
/// clone; safe to call from any thread.
#[derive(Clone)]
pub struct ReplicatorCallbacks {
    sender: mpsc::UnboundedSender<ReplicatorEvent>,
}

impl fmt::Debug for ReplicatorCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorCallbacks")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl ReplicatorCallbacks {
    pub fn status_changed(&self, status: ReplicatorStatus) {
        self.send(ReplicatorEvent::Status(status));
    }

    pub fn documents_ended(&self, pushing: bool, documents: Vec<DocumentEnded>) {
        self.send(ReplicatorEvent::DocumentsEnded { pushing, documents });
    }

    fn send(&self, event: ReplicatorEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Replicator gone; dropping engine callback");
        }
    }
}

/// Replicator options.
#[derive(Clone, Default)]
pub struct ReplicatorConfig {
    /// Resolver for pulled conflicts; [`DefaultConflictResolver`] if unset
    pub conflict_resolver: Option<Arc<dyn ConflictResolver>>,
}

impl fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("custom_resolver", &self.conflict_resolver.is_some())
            .finish()
    }
}

type StatusListener = Arc<dyn Fn(&ReplicatorStatus) + Send + Sync>;
type DocumentListener = Arc<dyn Fn(&DocumentReplication) + Send + Sync>;

struct ReplicatorInner {
    id: Uuid,
    database: Arc<DatabaseInner>,
    engine: Arc<dyn ReplicationEngine>,
    resolver: Arc<dyn ConflictResolver>,
    status: Mutex<ReplicatorStatus>,
    status_listeners: DashMap<ListenerToken, StatusListener>,
    document_listeners: DashMap<ListenerToken, DocumentListener>,
    sender: mpsc::UnboundedSender<ReplicatorEvent>,
    running: AtomicBool,
}

impl ReplicatorInner {
    fn callbacks(&self) -> ReplicatorCallbacks {
        ReplicatorCallbacks {
            sender: self.sender.clone(),
        }
    }

    fn apply_status(&self, status: ReplicatorStatus) {
        tracing::debug!(replicator = %self.id, activity = ?status.activity, "Replicator status changed");
        if let Some(error) = &status.error {
            tracing::warn!(
                replicator = %self.id,
                code = error.code(),
                error = %error,
                "Replicator reported an error"
            );
        }
        *self.status.lock() = status.clone();

        let listeners: Vec<StatusListener> = self
            .status_listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if status.activity == ActivityLevel::Stopped && self.running.swap(false, Ordering::AcqRel)
        {
            tracing::info!(replicator = %self.id, "Replicator stopped");
            self.database.active.deregister(self.id);
        }

        if !listeners.is_empty() {
            self.database.delivery.post(move || {
                for listener in &listeners {
                    listener(&status);
                }
            });
        }
    }

    fn post_documents(&self, pushing: bool, documents: Vec<DocumentEnded>) {
        let listeners: Vec<DocumentListener> = self
            .document_listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if listeners.is_empty() {
            return;
        }

        let replication = DocumentReplication { pushing, documents };
        self.database.delivery.post(move || {
            for listener in &listeners {
                listener(&replication);
            }
        });
    }
}

impl ActiveProcess for ReplicatorInner {
    fn stop(&self) {
        self.engine.stop();
    }

    fn describe(&self) -> String {
        format!("replicator {}", self.id)
    }
}

/// Dispatcher-owned ordering state.
#[derive(Default)]
struct Dispatcher {
    outstanding: usize,
    pending_statuses: VecDeque<ReplicatorStatus>,
}

impl Dispatcher {
    fn handle(&mut self, replicator: &Arc<ReplicatorInner>, event: ReplicatorEvent) {
        match event {
            ReplicatorEvent::Status(status) => {
                if self.outstanding > 0 {
                    tracing::debug!(
                        replicator = %replicator.id,
                        outstanding = self.outstanding,
                        "Holding status until conflicts resolve"
                    );
                    self.pending_statuses.push_back(status);
                } else {
                    replicator.apply_status(status);
                }
            }
            ReplicatorEvent::DocumentsEnded { pushing, documents } => {
                let mut ready = Vec::with_capacity(documents.len());
                for document in documents {
                    if !pushing && document.conflicted {
                        self.outstanding += 1;
                        self.schedule_resolution(replicator, document);
                    } else {
                        ready.push(document);
                    }
                }
                if !ready.is_empty() {
                    replicator.post_documents(pushing, ready);
                }
            }
            ReplicatorEvent::ConflictResolved(document) => {
                replicator.post_documents(false, vec![document]);
                self.outstanding = self.outstanding.saturating_sub(1);
                if self.outstanding == 0 {
                    while let Some(status) = self.pending_statuses.pop_front() {
                        replicator.apply_status(status);
                    }
                }
            }
        }
    }

    fn schedule_resolution(&self, replicator: &Arc<ReplicatorInner>, document: DocumentEnded) {
        let sender = replicator.sender.clone();
        let doc_id = document.id.clone();
        replicator.database.resolver_service.submit(
            &replicator.database,
            doc_id,
            replicator.resolver.clone(),
            Box::new(move |result| {
                let mut document = document;
                match result {
                    Ok(()) => {
                        document.conflicted = false;
                        document.error = None;
                    }
                    Err(e) => document.error = Some(e),
                }
                let _ = sender.send(ReplicatorEvent::ConflictResolved(document));
            }),
        );
    }
}

fn spawn_dispatcher(
    database: &DatabaseInner,
    replicator: Weak<ReplicatorInner>,
    mut events: mpsc::UnboundedReceiver<ReplicatorEvent>,
) {
    database.executor.spawn(async move {
        let mut dispatcher = Dispatcher::default();
        while let Some(event) = events.recv().await {
            let Some(replicator) = replicator.upgrade() else {
                break;
            };
            dispatcher.handle(&replicator, event);
        }
    });
}

/// A replicator bound to one database.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .finish()
    }
}

impl Replicator {
    pub fn new(
        database: &Database,
        engine: Arc<dyn ReplicationEngine>,
        config: ReplicatorConfig,
    ) -> Result<Self> {
        let database = database.inner().clone();
        if database.is_closed() {
            return Err(Error::NotOpen);
        }

        let (sender, events) = mpsc::unbounded_channel();
        let inner = Arc::new(ReplicatorInner {
            id: Uuid::new_v4(),
            resolver: config
                .conflict_resolver
                .unwrap_or_else(|| Arc::new(DefaultConflictResolver)),
            engine,
            status: Mutex::new(ReplicatorStatus::new(ActivityLevel::Stopped)),
            status_listeners: DashMap::new(),
            document_listeners: DashMap::new(),
            sender,
            running: AtomicBool::new(false),
            database,
        });
        spawn_dispatcher(&inner.database, Arc::downgrade(&inner), events);

        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Start the engine. The replicator keeps the database busy until a
    /// stopped status has been delivered.
    pub fn start(&self) -> Result<()> {
        if self.inner.database.is_closed() {
            return Err(Error::NotOpen);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let weak: Weak<ReplicatorInner> = Arc::downgrade(&self.inner);
        self.inner.database.active.register(self.inner.id, weak);
        tracing::info!(replicator = %self.inner.id, "Replicator starting");

        if let Err(e) = self.inner.engine.start(self.inner.callbacks()) {
            self.inner.running.store(false, Ordering::Release);
            self.inner.database.active.deregister(self.inner.id);
            tracing::warn!(replicator = %self.inner.id, error = %e, "Replication engine failed to start");
            return Err(e);
        }
        Ok(())
    }

    /// Ask the engine to stop.
    pub fn stop(&self) {
        self.inner.engine.stop();
    }

    /// Most recent status that passed through the pipeline.
    pub fn status(&self) -> ReplicatorStatus {
        self.inner.status.lock().clone()
    }

    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        let token = ListenerToken::new();
        self.inner.status_listeners.insert(token, Arc::new(listener));
        token
    }

    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        let token = ListenerToken::new();
        self.inner.document_listeners.insert(token, Arc::new(listener));
        token
    }

    /// Remove a status or document listener.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.inner.status_listeners.remove(&token).is_some()
            || self.inner.document_listeners.remove(&token).is_some()
    }
}
