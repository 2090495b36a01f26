//! Live queries: query results that refresh when the database changes.
//!
//! A live query is `Stopped` until started (explicitly or by its first
//! listener). While `Started` it watches database changes; a change
//! schedules a refresh after the configured debounce delay, moving it to
//! `Scheduled` so further changes within the window fold into the same
//! refresh. A refresh re-runs the query under the database lock and posts
//! new results only if they differ from the retained ones.
//!
//! Stopping does not recall a refresh already running; its results may
//! still be delivered once after `stop` returns.

use crate::active::ActiveProcess;
use crate::database::DatabaseInner;
use crate::error::{Error, Result};
use crate::notifier::{DatabaseChange, ListenerToken};
use dashmap::DashMap;
use harbor_engine::{Query, QueryResults};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Live query state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveQueryState {
    Stopped,
    /// Watching for changes
    Started,
    /// Refresh pending
    Scheduled,
}

/// Results delivered to live query listeners.
#[derive(Debug, Clone)]
pub struct QueryChange {
    pub results: Option<Arc<QueryResults>>,
    pub error: Option<Error>,
}

type QueryListener = Arc<dyn Fn(&QueryChange) + Send + Sync>;

struct LiveState {
    state: LiveQueryState,
    database_token: Option<ListenerToken>,
    results: Option<Arc<QueryResults>>,
}

struct LiveQueryInner {
    id: Uuid,
    query: Query,
    database: Arc<DatabaseInner>,
    delay: Duration,
    state: Mutex<LiveState>,
    listeners: DashMap<ListenerToken, QueryListener>,
}

impl LiveQueryInner {
    fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut live = self.state.lock();
            if self.database.is_closed() {
                return Err(Error::NotOpen);
            }
            if live.state == LiveQueryState::Stopped {
                live.state = LiveQueryState::Started;

                let weak = Arc::downgrade(self);
                live.database_token = Some(self.database.notifier.add_database_listener(
                    Arc::new(move |_: &DatabaseChange| {
                        if let Some(query) = weak.upgrade() {
                            query.update(query.delay);
                        }
                    }),
                ));

                let process: Weak<LiveQueryInner> = Arc::downgrade(self);
                self.database.active.register(self.id, process);
                tracing::info!(query = %self.id, "Live query started");
            }
        }
        self.update(Duration::ZERO);
        Ok(())
    }

    /// Schedule a refresh after `delay` unless one is already scheduled.
    fn update(self: &Arc<Self>, delay: Duration) {
        {
            let mut live = self.state.lock();
            if live.state != LiveQueryState::Started {
                return;
            }
            live.state = LiveQueryState::Scheduled;
        }

        let weak = Arc::downgrade(self);
        let handle = self.database.executor.handle().clone();
        self.database.executor.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let refreshed = handle
                .spawn_blocking(move || {
                    if let Some(query) = weak.upgrade() {
                        query.refresh();
                    }
                })
                .await;
            if let Err(e) = refreshed {
                tracing::warn!(error = %e, "Live query refresh panicked");
            }
        });
    }

    fn refresh(&self) {
        let previous = {
            let mut live = self.state.lock();
            if live.state != LiveQueryState::Scheduled {
                return;
            }
            live.state = LiveQueryState::Started;
            live.results.clone()
        };

        let outcome = self.database.with_store(|store| match &previous {
            Some(previous) => store.refresh_query(previous),
            None => store.execute_query(&self.query).map(Some),
        });

        let change = match outcome {
            Ok(Ok(Some(results))) => {
                let results = Arc::new(results);
                let mut live = self.state.lock();
                if live.state != LiveQueryState::Stopped {
                    live.results = Some(results.clone());
                }
                tracing::debug!(query = %self.id, rows = results.len(), "Live query results changed");
                QueryChange {
                    results: Some(results),
                    error: None,
                }
            }
            Ok(Ok(None)) => {
                tracing::debug!(query = %self.id, "Live query results unchanged");
                return;
            }
            Ok(Err(e)) => QueryChange {
                results: None,
                error: Some(e.into()),
            },
            Err(e) => QueryChange {
                results: None,
                error: Some(e),
            },
        };
        self.post(change);
    }

    fn post(&self, change: QueryChange) {
        let listeners: Vec<QueryListener> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        self.database.delivery.post(move || {
            for listener in &listeners {
                listener(&change);
            }
        });
    }

    fn halt(&self) {
        let token = {
            let mut live = self.state.lock();
            if live.state == LiveQueryState::Stopped {
                return;
            }
            live.state = LiveQueryState::Stopped;
            live.results = None;
            live.database_token.take()
        };

        if let Some(token) = token {
            self.database.notifier.remove_listener(token);
        }
        self.database.active.deregister(self.id);
        tracing::info!(query = %self.id, "Live query stopped");
    }
}

impl ActiveProcess for LiveQueryInner {
    fn stop(&self) {
        self.halt();
    }

    fn describe(&self) -> String {
        format!("live query {}", self.id)
    }
}

impl Drop for LiveQueryInner {
    fn drop(&mut self) {
        self.halt();
    }
}

/// A query whose results are kept up to date.
#[derive(Clone)]
pub struct LiveQuery {
    inner: Arc<LiveQueryInner>,
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl LiveQuery {
    pub(crate) fn new(database: Arc<DatabaseInner>, query: Query) -> Self {
        Self {
            inner: Arc::new(LiveQueryInner {
                id: Uuid::new_v4(),
                query,
                delay: database.config.live_query_delay,
                database,
                state: Mutex::new(LiveState {
                    state: LiveQueryState::Stopped,
                    database_token: None,
                    results: None,
                }),
                listeners: DashMap::new(),
            }),
        }
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    pub fn state(&self) -> LiveQueryState {
        self.inner.state.lock().state
    }

    /// Most recent results, if any have been computed since starting.
    pub fn results(&self) -> Option<Arc<QueryResults>> {
        self.inner.state.lock().results.clone()
    }

    /// Start watching. Runs the query immediately. Fails with
    /// [`Error::NotOpen`] once the database is closed.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stop watching and release the retained results.
    pub fn stop(&self) {
        self.inner.halt();
    }

    /// Add a listener, starting the query if needed. A listener added after
    /// results exist receives the current results right away.
    ///
    /// Fails with [`Error::NotOpen`], registering nothing, once the database
    /// is closed.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&QueryChange) + Send + Sync + 'static,
    {
        if self.inner.database.is_closed() {
            return Err(Error::NotOpen);
        }
        let token = ListenerToken::new();
        let listener: QueryListener = Arc::new(listener);
        self.inner.listeners.insert(token, listener.clone());

        if let Some(results) = self.results() {
            let change = QueryChange {
                results: Some(results),
                error: None,
            };
            self.inner.database.delivery.post(move || listener(&change));
        }

        if let Err(e) = self.inner.start() {
            self.inner.listeners.remove(&token);
            return Err(e);
        }
        Ok(token)
    }

    /// Remove a listener. Removing the last one stops the query.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        let removed = self.inner.listeners.remove(&token).is_some();
        if removed && self.inner.listeners.is_empty() {
            self.inner.halt();
        }
        removed
    }
}
