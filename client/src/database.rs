//! The database handle.
//!
//! A [`Database`] wraps one storage engine behind a single reentrant lock
//! and owns the runtime that runs its background work. Handles are cheap to
//! clone and share one open instance.
//!
//! # Lock order
//!
//! The database lock is always acquired before any subsystem lock (change
//! notifier, live query state, resolver service, replicator status), and no
//! subsystem lock is held while acquiring it. Application callbacks run
//! with no lock held.

use crate::active::ActiveProcesses;
use crate::config::DatabaseConfig;
use crate::conflict::ConflictHandler;
use crate::delivery::DeliveryQueue;
use crate::document::{DatabaseId, Document};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::live_query::LiveQuery;
use crate::notifier::{self, ChangeNotifier, DatabaseChange, DocumentChange, ListenerToken};
use crate::resolve;
use crate::save::{self, Baseline, ConcurrencyControl};
use crate::scheduler::ResolverService;
use harbor_engine::{MemoryStore, Query, Storage};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub(crate) struct DatabaseInner {
    pub(crate) id: DatabaseId,
    pub(crate) config: DatabaseConfig,
    store: ReentrantMutex<RefCell<Box<dyn Storage>>>,
    pub(crate) executor: Executor,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) notifier: ChangeNotifier,
    pub(crate) resolver_service: ResolverService,
    pub(crate) active: ActiveProcesses,
    close_lock: Mutex<()>,
    closed: AtomicBool,
}

impl DatabaseInner {
    /// Run `f` with exclusive access to the storage engine. This is the
    /// database lock.
    ///
    /// The lock is reentrant, but the engine is not: a nested call from
    /// inside `f` fails with [`Error::Unexpected`] instead of deadlocking.
    pub(crate) fn with_store<T>(&self, f: impl FnOnce(&mut dyn Storage) -> T) -> Result<T> {
        if self.is_closed() {
            return Err(Error::NotOpen);
        }
        // Close may have won the lock while we waited for it.
        self.locked(|store| {
            if self.is_closed() {
                Err(Error::NotOpen)
            } else {
                Ok(f(store))
            }
        })?
    }

    /// Like [`Self::with_store`], but also usable while the database is
    /// closing.
    pub(crate) fn locked<T>(&self, f: impl FnOnce(&mut dyn Storage) -> T) -> Result<T> {
        let guard = self.store.lock();
        let mut store = guard
            .try_borrow_mut()
            .map_err(|_| Error::Unexpected("storage engine re-entered".to_string()))?;
        Ok(f(&mut **store))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handle to an open database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("closed", &self.inner.is_closed())
            .field("listeners", &self.inner.notifier.listener_count())
            .finish()
    }
}

impl Database {
    /// Open a database on top of a storage engine.
    pub fn open<S>(storage: S, config: DatabaseConfig) -> Result<Self>
    where
        S: Storage + 'static,
    {
        config.validate()?;

        let id = Uuid::new_v4();
        let executor = Executor::new(&config)?;
        let delivery = DeliveryQueue::start(&executor);
        let resolver_service = ResolverService::new(executor.handle().clone());
        let notifier = ChangeNotifier::new(id, &config);

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let mut storage: Box<dyn Storage> = Box::new(storage);
        storage.set_change_observer(Some(Box::new(move || {
            let _ = signals.send(());
        })));

        let inner = Arc::new(DatabaseInner {
            id,
            config,
            store: ReentrantMutex::new(RefCell::new(storage)),
            executor,
            delivery,
            notifier,
            resolver_service,
            active: ActiveProcesses::default(),
            close_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        notifier::spawn_dispatcher(&inner, signal_rx);

        tracing::info!(database = %inner.config.name, id = %id, "Database opened");
        Ok(Self { inner })
    }

    /// Open an empty database backed by a [`MemoryStore`].
    pub fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        let config = DatabaseConfig::new(name);
        Self::open(MemoryStore::new(config.name.clone()), config)
    }

    pub(crate) fn inner(&self) -> &Arc<DatabaseInner> {
        &self.inner
    }

    pub fn id(&self) -> DatabaseId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Load a document. Deleted documents read as `None`.
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let revision = self.inner.with_store(|store| store.get_document(id))??;
        Ok(revision
            .filter(|r| !r.is_deleted())
            .map(|r| Document::from_revision(Arc::new(r), self.inner.id)))
    }

    /// Number of live documents.
    pub fn document_count(&self) -> Result<usize> {
        self.inner.with_store(|store| store.document_count())
    }

    /// Save, overwriting any concurrent change.
    pub fn save(&self, doc: &mut Document) -> Result<()> {
        self.save_with_concurrency_control(doc, ConcurrencyControl::LastWriteWins)
            .map(|_| ())
    }

    /// Save under an explicit policy. Returns `false` if the save
    /// conflicted under [`ConcurrencyControl::FailOnConflict`].
    pub fn save_with_concurrency_control(
        &self,
        doc: &mut Document,
        policy: ConcurrencyControl,
    ) -> Result<bool> {
        self.check_binding(doc)?;
        self.inner.with_store(|store| {
            save::save_document(store, self.inner.id, doc, Baseline::Loaded, false, policy)
        })?
    }

    /// Save, consulting `handler` each time the save conflicts.
    ///
    /// Gives up with [`Error::Conflict`] when the handler declines or fails,
    /// and with [`Error::Unexpected`] after
    /// [`MAX_CONFLICT_RETRIES`](crate::MAX_CONFLICT_RETRIES) attempts.
    pub fn save_with_conflict_handler(
        &self,
        doc: &mut Document,
        handler: &dyn ConflictHandler,
    ) -> Result<bool> {
        self.check_binding(doc)?;
        resolve::save_with_handler(&self.inner, doc, handler)
    }

    /// Delete, overwriting any concurrent change.
    pub fn delete(&self, doc: &mut Document) -> Result<()> {
        self.delete_with_concurrency_control(doc, ConcurrencyControl::LastWriteWins)
            .map(|_| ())
    }

    pub fn delete_with_concurrency_control(
        &self,
        doc: &mut Document,
        policy: ConcurrencyControl,
    ) -> Result<bool> {
        self.check_binding(doc)?;
        self.inner.with_store(|store| {
            save::save_document(store, self.inner.id, doc, Baseline::Loaded, true, policy)
        })?
    }

    /// Run `f` against the storage engine with the database lock held.
    ///
    /// This is how a replication engine writes pulled revisions.
    pub fn with_storage<T>(&self, f: impl FnOnce(&mut dyn Storage) -> T) -> Result<T> {
        self.inner.with_store(f)
    }

    /// Listen for committed changes to any document.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DatabaseChange) + Send + Sync + 'static,
    {
        self.inner.notifier.add_database_listener(Arc::new(listener))
    }

    /// Listen for committed changes to one document.
    pub fn add_document_change_listener<F>(
        &self,
        document_id: impl Into<String>,
        listener: F,
    ) -> ListenerToken
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.inner
            .notifier
            .add_document_listener(document_id.into(), Arc::new(listener))
    }

    /// Remove a database or document change listener.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.inner.notifier.remove_listener(token)
    }

    /// Create a live query. It starts when started explicitly or when its
    /// first listener is added.
    pub fn live_query(&self, query: Query) -> LiveQuery {
        LiveQuery::new(self.inner.clone(), query)
    }

    /// The scheduler running replication conflict resolutions.
    pub fn resolver_service(&self) -> &ResolverService {
        &self.inner.resolver_service
    }

    /// Live queries and replicators currently keeping the database busy.
    pub fn active_process_count(&self) -> usize {
        self.inner.active.count()
    }

    /// Close the database.
    ///
    /// Stops every live query and replicator and waits for them to wind
    /// down, then waits for in-flight conflict resolutions. Fails with
    /// [`Error::Busy`] if either does not finish within
    /// `close_retries * close_retry_timeout`; the database then stays open.
    /// Closing a closed database is a no-op.
    pub fn close(&self) -> Result<()> {
        let _closing = self.inner.close_lock.lock();
        if self.inner.is_closed() {
            return Ok(());
        }

        let config = &self.inner.config;
        tracing::info!(database = %config.name, "Closing database");

        self.inner.active.stop_all();
        self.inner
            .active
            .wait_idle(config.close_retries, config.close_retry_timeout)?;

        let budget = config.close_retry_timeout * config.close_retries.max(1);
        self.inner.resolver_service.shutdown(true, || {});
        if !self.inner.resolver_service.wait_stopped(budget) {
            return Err(Error::Busy(format!(
                "{} conflict resolution(s) still running",
                self.inner.resolver_service.in_flight().len()
            )));
        }

        // Writers still waiting on the lock see the flag once they get it.
        self.inner.with_store(|store| {
            store.set_change_observer(None);
            self.inner.closed.store(true, Ordering::Release);
        })?;

        // Deliver what was committed before the flag went up.
        if let Err(e) = self.inner.notifier.drain(&self.inner) {
            tracing::warn!(error = %e, "Final change drain failed");
        }
        if !self.inner.delivery.flush(config.close_retry_timeout) {
            tracing::warn!(database = %config.name, "Listeners still running at close");
        }

        // Anything that started while the database was closing.
        self.inner.active.stop_all();
        self.inner.executor.shutdown();

        tracing::info!(database = %config.name, "Database closed");
        Ok(())
    }

    fn check_binding(&self, doc: &Document) -> Result<()> {
        match doc.database_id() {
            Some(other) if other != self.inner.id => Err(Error::Unexpected(format!(
                "document {} belongs to another database",
                doc.id()
            ))),
            _ => Ok(()),
        }
    }
}
