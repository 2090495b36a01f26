//! Conflict orchestration.
//!
//! Both paths loop a bounded number of times: reading state under the
//! database lock, consulting application code without it, and writing the
//! outcome back under the lock. Losing a race in between simply costs an
//! attempt.

use crate::conflict::{guarded, Conflict, ConflictHandler, ConflictResolver};
use crate::database::DatabaseInner;
use crate::document::{DatabaseId, Document};
use crate::error::{ConflictCause, Error, Result};
use crate::save::{self, Baseline, ConcurrencyControl};
use harbor_engine::{contains_blob, MergedRevision, Revision, RevisionFlags, Storage};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attempts made by either conflict path before giving up.
pub const MAX_CONFLICT_RETRIES: usize = 13;

/// Save `doc`, asking `handler` how to proceed on each conflict.
pub(crate) fn save_with_handler(
    db: &DatabaseInner,
    doc: &mut Document,
    handler: &dyn ConflictHandler,
) -> Result<bool> {
    let mut baseline: Option<Option<Arc<Revision>>> = None;

    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let saved = db.with_store(|store| {
            let base = match &baseline {
                None => Baseline::Loaded,
                Some(revision) => Baseline::Explicit(revision.as_deref()),
            };
            save::save_document(store, db.id, doc, base, false, ConcurrencyControl::FailOnConflict)
        })??;
        if saved {
            return Ok(true);
        }

        let current = db
            .with_store(|store| store.get_document(doc.id()))??
            .map(Arc::new);
        let current_doc = current
            .as_ref()
            .filter(|r| !r.is_deleted())
            .map(|r| Document::from_revision(r.clone(), db.id));

        tracing::debug!(doc_id = %doc.id(), attempt, "Save conflicted; consulting conflict handler");
        match guarded(|| handler.handle(doc, current_doc.as_ref())) {
            Ok(true) => baseline = Some(current),
            Ok(false) => {
                return Err(Error::Conflict {
                    doc_id: doc.id().to_string(),
                    cause: ConflictCause::Rejected,
                })
            }
            Err(message) => {
                tracing::warn!(doc_id = %doc.id(), error = %message, "Conflict handler failed");
                return Err(Error::Conflict {
                    doc_id: doc.id().to_string(),
                    cause: ConflictCause::HandlerFailed(message),
                });
            }
        }
    }

    Err(Error::Unexpected(format!(
        "document {} still conflicting after {} attempts",
        doc.id(),
        MAX_CONFLICT_RETRIES
    )))
}

/// Resolve the conflicting branches of a pulled document.
///
/// Returns `Ok` without doing anything if the conflict was already resolved
/// by someone else.
pub(crate) fn resolve_pulled_conflict(
    db: &DatabaseInner,
    doc_id: &str,
    resolver: &dyn ConflictResolver,
    cancelled: &AtomicBool,
) -> Result<()> {
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        if cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled(format!(
                "conflict resolution for document {doc_id}"
            )));
        }

        let (local, remote) = db.with_store(|store| -> harbor_engine::Result<_> {
            Ok((
                store.get_document(doc_id)?,
                store.next_conflicting_revision(doc_id)?,
            ))
        })??;
        let Some(remote) = remote else {
            tracing::debug!(doc_id, "Conflict already resolved");
            return Ok(());
        };
        let Some(local) = local else {
            return Err(Error::NotFound(doc_id.to_string()));
        };

        let merged = if local.is_deleted() && remote.is_deleted() {
            None
        } else {
            let answer = consult(db.id, doc_id, resolver, &local, &remote)?;
            merged_revision(answer.as_ref(), &remote)
        };

        match db.with_store(|store| persist(store, doc_id, &local, &remote, merged))? {
            Ok(resolved) => {
                tracing::info!(
                    doc_id,
                    rev_id = %resolved.rev_id,
                    deleted = resolved.is_deleted(),
                    "Resolved conflict"
                );
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(doc_id, attempt, "Document changed during resolution; retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::Unexpected(format!(
        "conflict on document {doc_id} unresolved after {MAX_CONFLICT_RETRIES} attempts"
    )))
}

/// Ask the resolver for a winner and validate its answer.
fn consult(
    database: DatabaseId,
    doc_id: &str,
    resolver: &dyn ConflictResolver,
    local: &Revision,
    remote: &Revision,
) -> Result<Option<Document>> {
    let side = |revision: &Revision| {
        (!revision.is_deleted())
            .then(|| Document::from_revision(Arc::new(revision.clone()), database))
    };
    let conflict = Conflict::new(doc_id, side(local), side(remote));

    let answer = guarded(|| resolver.resolve(&conflict)).map_err(|message| {
        tracing::warn!(doc_id, error = %message, "Conflict resolver failed");
        Error::Conflict {
            doc_id: doc_id.to_string(),
            cause: ConflictCause::ResolverFailed(message),
        }
    })?;

    let Some(answer) = answer else {
        return Ok(None);
    };
    if answer.database_id().is_some_and(|other| other != database) {
        return Err(Error::Unexpected(format!(
            "resolver for document {doc_id} returned a document from another database"
        )));
    }
    if answer.id() != doc_id {
        tracing::warn!(
            doc_id,
            returned = %answer.id(),
            "Conflict resolver returned a different document; keeping its body under the conflicting id"
        );
        return Ok(Some(answer.renamed(doc_id)));
    }
    Ok(Some(answer))
}

/// What to write on top of the remote branch for a resolver answer.
fn merged_revision(answer: Option<&Document>, remote: &Revision) -> Option<MergedRevision> {
    match answer {
        None if remote.is_deleted() => None,
        None => Some(MergedRevision {
            body: json!({}),
            flags: RevisionFlags::tombstone(),
        }),
        Some(doc) if is_remote(doc, remote) => None,
        Some(doc) => {
            let body = doc.to_value();
            Some(MergedRevision {
                flags: RevisionFlags {
                    deleted: false,
                    has_attachments: contains_blob(&body),
                },
                body,
            })
        }
    }
}

fn is_remote(doc: &Document, remote: &Revision) -> bool {
    doc.revision_id() == Some(&remote.rev_id) && doc.to_value() == remote.body
}

fn persist(
    store: &mut dyn Storage,
    doc_id: &str,
    local: &Revision,
    remote: &Revision,
    merged: Option<MergedRevision>,
) -> harbor_engine::Result<Revision> {
    store.begin_transaction()?;
    match store.resolve_conflict(doc_id, &remote.rev_id, &local.rev_id, merged) {
        Ok(revision) => {
            store.end_transaction(true)?;
            Ok(revision)
        }
        Err(e) => {
            if let Err(abort) = store.end_transaction(false) {
                tracing::error!(doc_id, error = %abort, "Failed to roll back conflict resolution");
            }
            Err(e)
        }
    }
}
