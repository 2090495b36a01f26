//! Conflict handlers and resolvers.
//!
//! Two kinds of conflict reach application code:
//!
//! - A local save whose baseline is stale is offered to a
//!   [`ConflictHandler`], which may edit the proposed document and retry.
//! - A revision pulled by replication that branches from local history is
//!   offered to a [`ConflictResolver`], which picks or merges a winner.
//!
//! Both are called without the database lock held, and both may fail or
//! panic; failures surface as [`crate::Error::Conflict`].

use crate::document::Document;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Error type returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Decides what to do when a local save conflicts.
pub trait ConflictHandler: Send + Sync {
    /// Inspect `current` (None if the document was deleted) and optionally
    /// edit `proposed`. Return `true` to retry the save on top of `current`,
    /// `false` to give up.
    fn handle(&self, proposed: &mut Document, current: Option<&Document>)
        -> Result<bool, BoxError>;
}

/// Picks the winner of a replication conflict.
pub trait ConflictResolver: Send + Sync {
    /// Return the document to keep, or `None` to delete it.
    fn resolve(&self, conflict: &Conflict) -> Result<Option<Document>, BoxError>;
}

/// The two sides of a replication conflict. A side is `None` when that
/// revision is a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    document_id: String,
    local: Option<Document>,
    remote: Option<Document>,
}

impl Conflict {
    pub fn new(
        document_id: impl Into<String>,
        local: Option<Document>,
        remote: Option<Document>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            local,
            remote,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn local(&self) -> Option<&Document> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&Document> {
        self.remote.as_ref()
    }
}

/// Resolver used when a replicator is configured without one.
///
/// A deletion always wins. Otherwise the revision with the higher
/// generation wins, with ties broken by the greater revision id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> Result<Option<Document>, BoxError> {
        match (conflict.local(), conflict.remote()) {
            (None, _) | (_, None) => Ok(None),
            (Some(local), Some(remote)) => {
                if local.revision_id() > remote.revision_id() {
                    Ok(Some(local.clone()))
                } else {
                    Ok(Some(remote.clone()))
                }
            }
        }
    }
}

/// Adapts a closure into a [`ConflictHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Document, Option<&Document>) -> Result<bool, BoxError> + Send + Sync,
{
    HandlerFn(f)
}

/// Adapts a closure into a [`ConflictResolver`].
pub fn resolver_fn<F>(f: F) -> ResolverFn<F>
where
    F: Fn(&Conflict) -> Result<Option<Document>, BoxError> + Send + Sync,
{
    ResolverFn(f)
}

/// See [`handler_fn`].
#[derive(Clone, Copy)]
pub struct HandlerFn<F>(F);

impl<F> ConflictHandler for HandlerFn<F>
where
    F: Fn(&mut Document, Option<&Document>) -> Result<bool, BoxError> + Send + Sync,
{
    fn handle(
        &self,
        proposed: &mut Document,
        current: Option<&Document>,
    ) -> Result<bool, BoxError> {
        (self.0)(proposed, current)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

/// See [`resolver_fn`].
#[derive(Clone, Copy)]
pub struct ResolverFn<F>(F);

impl<F> ConflictResolver for ResolverFn<F>
where
    F: Fn(&Conflict) -> Result<Option<Document>, BoxError> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Result<Option<Document>, BoxError> {
        (self.0)(conflict)
    }
}

impl<F> fmt::Debug for ResolverFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResolverFn")
    }
}

/// Run an application callback, turning both errors and panics into a
/// message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, BoxError>) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
