//! Saving and deleting documents under a concurrency-control policy.
//!
//! Everything here runs with the database lock held, inside one engine
//! transaction per attempt.

use crate::document::{DatabaseId, Document};
use crate::error::{Error, Result};
use harbor_engine::{PutRevision, Revision, RevisionId, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to do when a save finds that its baseline is no longer current.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyControl {
    /// Overwrite whatever is current
    #[default]
    LastWriteWins,
    /// Leave the database untouched and report the conflict
    FailOnConflict,
}

/// Revision a write is based on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Baseline<'a> {
    /// The revision the document handle was loaded at.
    Loaded,
    /// An explicit revision; `None` means the document is expected absent.
    Explicit(Option<&'a Revision>),
}

enum Written {
    Revision(Revision),
    /// Deleting something that is already gone.
    AlreadyDeleted(Option<Revision>),
    Conflicted,
}

/// Write `doc` (or a tombstone for it) in its own transaction.
///
/// Returns `Ok(false)` only under [`ConcurrencyControl::FailOnConflict`]
/// when the baseline is stale; the transaction is rolled back and `doc`
/// is left as it was. On success `doc` is bound to the new revision.
pub(crate) fn save_document(
    store: &mut dyn Storage,
    database: DatabaseId,
    doc: &mut Document,
    baseline: Baseline<'_>,
    deleting: bool,
    policy: ConcurrencyControl,
) -> Result<bool> {
    if deleting && doc.revision().is_none() {
        return Err(Error::NotFound(doc.id().to_string()));
    }

    store.begin_transaction()?;
    match write_revision(store, doc, baseline, deleting, policy) {
        Ok(Written::Conflicted) => {
            store.end_transaction(false)?;
            Ok(false)
        }
        Ok(written) => {
            store.end_transaction(true)?;
            match written {
                Written::Revision(revision) | Written::AlreadyDeleted(Some(revision)) => {
                    doc.adopt_revision(Arc::new(revision), database)
                }
                Written::AlreadyDeleted(None) => doc.mark_deleted(database),
                Written::Conflicted => {}
            }
            Ok(true)
        }
        Err(e) => {
            if let Err(abort) = store.end_transaction(false) {
                tracing::error!(doc_id = %doc.id(), error = %abort, "Failed to roll back save");
            }
            Err(e)
        }
    }
}

fn write_revision(
    store: &mut dyn Storage,
    doc: &Document,
    baseline: Baseline<'_>,
    deleting: bool,
    policy: ConcurrencyControl,
) -> Result<Written> {
    let parent = match baseline {
        Baseline::Loaded => doc.revision_id().cloned(),
        Baseline::Explicit(revision) => revision.map(|r| r.rev_id.clone()),
    };

    match store.put_revision(request(doc, deleting, parent)) {
        Ok(revision) => Ok(Written::Revision(revision)),
        Err(e) if e.is_conflict() => match policy {
            ConcurrencyControl::FailOnConflict => {
                tracing::debug!(doc_id = %doc.id(), "Save conflicted; failing");
                Ok(Written::Conflicted)
            }
            ConcurrencyControl::LastWriteWins => {
                let current = store.get_document(doc.id())?;
                if deleting && current.as_ref().map_or(true, Revision::is_deleted) {
                    tracing::debug!(doc_id = %doc.id(), "Document already deleted");
                    return Ok(Written::AlreadyDeleted(current));
                }

                tracing::debug!(doc_id = %doc.id(), "Save conflicted; overwriting current revision");
                let parent = current.map(|r| r.rev_id);
                Ok(Written::Revision(
                    store.put_revision(request(doc, deleting, parent))?,
                ))
            }
        },
        Err(e) => Err(e.into()),
    }
}

fn request(doc: &Document, deleting: bool, parent: Option<RevisionId>) -> PutRevision {
    if deleting {
        PutRevision::tombstone(doc.id(), parent)
    } else {
        PutRevision::new(doc.id(), doc.to_value(), parent)
    }
}
