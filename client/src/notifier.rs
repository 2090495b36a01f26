//! Database and document change notifications.
//!
//! The storage engine's change observer fires on the committing thread with
//! the store still borrowed, so it only sends a wake-up signal. A dispatcher
//! task drains the engine's change queue afterwards, under the database lock,
//! and coalesces raw change records into notifications:
//!
//! - records are pulled in batches of `change_batch_size`;
//! - consecutive batches of the same origin accumulate into one notification;
//! - a notification is posted when the origin flips, when appending the next
//!   batch would exceed `max_notification_ids`, or when the queue is drained.
//!
//! Finished notifications go to the database's delivery queue, once to every
//! database listener and once per changed document to that document's
//! listeners.

use crate::config::DatabaseConfig;
use crate::database::DatabaseInner;
use crate::document::DatabaseId;
use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle returned when a listener is registered; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(Uuid);

impl ListenerToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A set of documents that changed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseChange {
    pub database_id: DatabaseId,
    /// Changed documents, in commit order
    pub document_ids: Vec<String>,
    /// True if the changes were pulled by replication
    pub external: bool,
}

/// A change to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub database_id: DatabaseId,
    pub document_id: String,
    pub external: bool,
}

pub(crate) type DatabaseListener = Arc<dyn Fn(&DatabaseChange) + Send + Sync>;
pub(crate) type DocumentListener = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

struct DocumentRegistration {
    document_id: String,
    listener: DocumentListener,
}

/// Document ids ready to be posted as one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChangeBatch {
    pub(crate) external: bool,
    pub(crate) document_ids: Vec<String>,
}

/// Accumulates raw change batches into bounded, origin-homogeneous
/// notifications.
#[derive(Debug)]
pub(crate) struct Coalescer {
    max_ids: usize,
    pending: Vec<String>,
    external: bool,
}

impl Coalescer {
    pub(crate) fn new(max_ids: usize) -> Self {
        Self {
            max_ids: max_ids.max(1),
            pending: Vec::new(),
            external: false,
        }
    }

    /// Feed one batch read from the engine. An empty batch means the queue
    /// is drained and flushes whatever is pending.
    pub(crate) fn accept(&mut self, external: bool, ids: Vec<String>) -> Vec<ChangeBatch> {
        let mut ready = Vec::new();
        if ids.is_empty() {
            self.flush_into(&mut ready);
            return ready;
        }

        if external != self.external {
            self.flush_into(&mut ready);
            self.external = external;
        }
        for chunk in ids.chunks(self.max_ids) {
            if self.pending.len() + chunk.len() > self.max_ids {
                self.flush_into(&mut ready);
            }
            self.pending.extend_from_slice(chunk);
        }
        ready
    }

    fn flush_into(&mut self, ready: &mut Vec<ChangeBatch>) {
        if !self.pending.is_empty() {
            ready.push(ChangeBatch {
                external: self.external,
                document_ids: mem::take(&mut self.pending),
            });
        }
    }
}

/// Listener registry and change aggregation for one database.
pub(crate) struct ChangeNotifier {
    database_id: DatabaseId,
    batch_size: usize,
    database_listeners: DashMap<ListenerToken, DatabaseListener>,
    document_listeners: DashMap<ListenerToken, DocumentRegistration>,
    /// Index of document listeners by document id.
    by_document: DashMap<String, Vec<ListenerToken>>,
    coalescer: Mutex<Coalescer>,
}

impl ChangeNotifier {
    pub(crate) fn new(database_id: DatabaseId, config: &DatabaseConfig) -> Self {
        Self {
            database_id,
            batch_size: config.change_batch_size,
            database_listeners: DashMap::new(),
            document_listeners: DashMap::new(),
            by_document: DashMap::new(),
            coalescer: Mutex::new(Coalescer::new(config.max_notification_ids)),
        }
    }

    pub(crate) fn add_database_listener(&self, listener: DatabaseListener) -> ListenerToken {
        let token = ListenerToken::new();
        self.database_listeners.insert(token, listener);
        tracing::debug!(token = %token, "Database change listener registered");
        token
    }

    pub(crate) fn add_document_listener(
        &self,
        document_id: String,
        listener: DocumentListener,
    ) -> ListenerToken {
        let token = ListenerToken::new();
        self.document_listeners.insert(
            token,
            DocumentRegistration {
                document_id: document_id.clone(),
                listener,
            },
        );
        self.by_document.entry(document_id.clone()).or_default().push(token);
        tracing::debug!(token = %token, doc_id = %document_id, "Document change listener registered");
        token
    }

    /// Remove a database or document listener. Returns false for unknown
    /// tokens.
    pub(crate) fn remove_listener(&self, token: ListenerToken) -> bool {
        if self.database_listeners.remove(&token).is_some() {
            tracing::debug!(token = %token, "Database change listener removed");
            return true;
        }

        let Some((_, registration)) = self.document_listeners.remove(&token) else {
            return false;
        };
        if let Some(mut tokens) = self.by_document.get_mut(&registration.document_id) {
            tokens.retain(|t| *t != token);
            if tokens.is_empty() {
                drop(tokens);
                self.by_document.remove(&registration.document_id);
            }
        }
        tracing::debug!(token = %token, doc_id = %registration.document_id, "Document change listener removed");
        true
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.database_listeners.len() + self.document_listeners.len()
    }

    /// Read every pending change from the engine and post the resulting
    /// notifications. Returns how many notifications were produced.
    pub(crate) fn drain(&self, db: &DatabaseInner) -> Result<usize> {
        let batches = db.locked(|store| {
            let mut coalescer = self.coalescer.lock();
            let mut ready = Vec::new();
            loop {
                let observed = store.read_changes(self.batch_size);
                let exhausted = observed.is_empty();
                let ids = observed.changes.into_iter().map(|c| c.doc_id).collect();
                ready.extend(coalescer.accept(observed.external, ids));
                if exhausted {
                    break ready;
                }
            }
        })?;

        let count = batches.len();
        for batch in batches {
            self.post(db, batch);
        }
        Ok(count)
    }

    fn post(&self, db: &DatabaseInner, batch: ChangeBatch) {
        let change = DatabaseChange {
            database_id: self.database_id,
            document_ids: batch.document_ids,
            external: batch.external,
        };

        let listeners: Vec<DatabaseListener> = self
            .database_listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut per_document = Vec::new();
        for document_id in &change.document_ids {
            let Some(tokens) = self.by_document.get(document_id) else {
                continue;
            };
            for token in tokens.iter() {
                if let Some(registration) = self.document_listeners.get(token) {
                    per_document.push((
                        DocumentChange {
                            database_id: self.database_id,
                            document_id: document_id.clone(),
                            external: change.external,
                        },
                        registration.listener.clone(),
                    ));
                }
            }
        }

        tracing::debug!(
            documents = change.document_ids.len(),
            external = change.external,
            listeners = listeners.len() + per_document.len(),
            "Posting database change"
        );

        if listeners.is_empty() && per_document.is_empty() {
            return;
        }
        db.delivery.post(move || {
            for listener in &listeners {
                listener(&change);
            }
            for (document_change, listener) in &per_document {
                listener(document_change);
            }
        });
    }
}

/// Spawn the task that turns engine wake-ups into drains. Drains run on the
/// blocking pool, one at a time; wake-ups that arrive during a drain are
/// folded into the next one.
pub(crate) fn spawn_dispatcher(db: &Arc<DatabaseInner>, mut signals: mpsc::UnboundedReceiver<()>) {
    let weak = Arc::downgrade(db);
    let handle = db.executor.handle().clone();

    db.executor.spawn(async move {
        while signals.recv().await.is_some() {
            while signals.try_recv().is_ok() {}

            let weak = weak.clone();
            let drained = handle
                .spawn_blocking(move || {
                    let Some(db) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = db.notifier.drain(&db) {
                        tracing::debug!(error = %e, "Change drain skipped");
                    }
                })
                .await;
            if let Err(e) = drained {
                tracing::warn!(error = %e, "Change drain panicked");
            }
        }
    });
}
