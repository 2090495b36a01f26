//! MemoryStore - the in-memory reference storage engine.
//!
//! Each document keeps its current revision plus any conflicting branches
//! pulled in by replication that have not been resolved yet. Writes are only
//! accepted inside a transaction; the outermost commit publishes change
//! records to the observer queue, a rollback restores the state captured when
//! the transaction began.

use crate::{
    error::Result, ChangeObserver, ChangeRecord, DocumentId, Error, MergedRevision, NodeId,
    ObservedChanges, Origin, PutRevision, Query, QueryResults, ResultRow, Revision,
    RevisionFlags, RevisionId, Sequence, Storage,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A document's current revision and its open conflicts.
#[derive(Debug, Clone)]
struct DocumentEntry {
    current: Revision,
    /// Unresolved remote branches, highest revision id first
    conflicts: Vec<Revision>,
}

#[derive(Debug)]
struct Transaction {
    depth: usize,
    poisoned: bool,
    saved_documents: BTreeMap<DocumentId, DocumentEntry>,
    saved_sequence: Sequence,
    staged: Vec<ChangeRecord>,
}

/// In-memory implementation of [`Storage`].
pub struct MemoryStore {
    node_id: NodeId,
    documents: BTreeMap<DocumentId, DocumentEntry>,
    sequence: Sequence,
    transaction: Option<Transaction>,
    pending_changes: VecDeque<ChangeRecord>,
    observer: Option<ChangeObserver>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("node_id", &self.node_id)
            .field("documents", &self.documents.len())
            .field("sequence", &self.sequence)
            .field("in_transaction", &self.transaction.is_some())
            .field("pending_changes", &self.pending_changes.len())
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store for the given node.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            documents: BTreeMap::new(),
            sequence: 0,
            transaction: None,
            pending_changes: VecDeque::new(),
            observer: None,
        }
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// All unresolved conflicting branches of a document.
    pub fn conflicting_revisions(&self, doc_id: &str) -> Vec<Revision> {
        self.documents
            .get(doc_id)
            .map(|e| e.conflicts.clone())
            .unwrap_or_default()
    }

    /// Record a revision pulled from a remote peer.
    ///
    /// If the document is absent or `parent` is its current revision the
    /// pulled revision becomes current; otherwise it is kept as a conflicting
    /// branch. The change is marked external.
    pub fn insert_remote_revision(
        &mut self,
        doc_id: &str,
        body: serde_json::Value,
        deleted: bool,
        parent: Option<RevisionId>,
    ) -> Result<Revision> {
        validate_doc_id(doc_id)?;
        let flags = if deleted {
            RevisionFlags::tombstone()
        } else {
            RevisionFlags {
                deleted: false,
                has_attachments: crate::revision::contains_blob(&body),
            }
        };
        let body = if deleted {
            serde_json::Value::Object(Default::default())
        } else {
            body
        };

        self.sequence += 1;
        let generation = RevisionId::next_generation(parent.as_ref());
        let rev_id = RevisionId::new(
            generation,
            self.digest("remote", doc_id, generation, &body, deleted),
        );
        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id,
            parent,
            body,
            flags,
            sequence: self.sequence,
            origin: Origin::Remote,
        };

        match self.documents.get_mut(doc_id) {
            Some(entry) if revision.parent.as_ref() != Some(&entry.current.rev_id) => {
                entry.conflicts.push(revision.clone());
                entry.conflicts.sort_by(|a, b| b.rev_id.cmp(&a.rev_id));
            }
            Some(entry) => entry.current = revision.clone(),
            None => {
                self.documents.insert(
                    doc_id.to_string(),
                    DocumentEntry {
                        current: revision.clone(),
                        conflicts: Vec::new(),
                    },
                );
            }
        }

        self.record_change(&revision, true);
        Ok(revision)
    }

    fn digest(
        &self,
        tag: &str,
        doc_id: &str,
        generation: u64,
        body: &serde_json::Value,
        deleted: bool,
    ) -> String {
        let mut hasher = DefaultHasher::new();
        self.node_id.hash(&mut hasher);
        tag.hash(&mut hasher);
        doc_id.hash(&mut hasher);
        generation.hash(&mut hasher);
        self.sequence.hash(&mut hasher);
        body.to_string().hash(&mut hasher);
        deleted.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn require_transaction(&self) -> Result<()> {
        if self.transaction.is_some() {
            Ok(())
        } else {
            Err(Error::NoTransaction)
        }
    }

    fn record_change(&mut self, revision: &Revision, external: bool) {
        let change = ChangeRecord {
            doc_id: revision.doc_id.clone(),
            rev_id: revision.rev_id.clone(),
            sequence: revision.sequence,
            external,
        };
        match self.transaction.as_mut() {
            Some(tx) => tx.staged.push(change),
            None => self.publish(vec![change]),
        }
    }

    fn publish(&mut self, changes: Vec<ChangeRecord>) {
        if changes.is_empty() {
            return;
        }
        // Nobody is listening; nothing to accumulate.
        let Some(observer) = self.observer.as_ref() else {
            return;
        };
        self.pending_changes.extend(changes);
        observer();
    }

    fn run_query(&self, query: &Query) -> QueryResults {
        let rows = self
            .documents
            .values()
            .map(|e| &e.current)
            .filter(|rev| !rev.is_deleted() && query.matches(&rev.body))
            .take(query.row_limit().unwrap_or(usize::MAX))
            .map(|rev| ResultRow {
                id: rev.doc_id.clone(),
                rev_id: rev.rev_id.clone(),
                body: rev.body.clone(),
            })
            .collect();
        QueryResults::new(query.clone(), rows, self.sequence)
    }
}

fn validate_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() || doc_id.len() > 240 {
        return Err(Error::InvalidDocumentId(doc_id.to_string()));
    }
    Ok(())
}

impl Storage for MemoryStore {
    fn begin_transaction(&mut self) -> Result<()> {
        match self.transaction.as_mut() {
            Some(tx) => tx.depth += 1,
            None => {
                self.transaction = Some(Transaction {
                    depth: 1,
                    poisoned: false,
                    saved_documents: self.documents.clone(),
                    saved_sequence: self.sequence,
                    staged: Vec::new(),
                });
            }
        }
        Ok(())
    }

    fn end_transaction(&mut self, commit: bool) -> Result<()> {
        let tx = self.transaction.as_mut().ok_or(Error::NoTransaction)?;
        tx.poisoned |= !commit;
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }

        let Some(tx) = self.transaction.take() else {
            return Err(Error::NoTransaction);
        };
        if tx.poisoned {
            self.documents = tx.saved_documents;
            self.sequence = tx.saved_sequence;
            return if commit {
                Err(Error::TransactionAborted)
            } else {
                Ok(())
            };
        }

        self.publish(tx.staged);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn get_document(&self, doc_id: &str) -> Result<Option<Revision>> {
        Ok(self.documents.get(doc_id).map(|e| e.current.clone()))
    }

    fn put_revision(&mut self, request: PutRevision) -> Result<Revision> {
        self.require_transaction()?;
        validate_doc_id(&request.doc_id)?;

        let current = self.documents.get(&request.doc_id).map(|e| &e.current.rev_id);
        if request.parent.as_ref() != current {
            return Err(Error::Conflict(request.doc_id));
        }

        self.sequence += 1;
        let generation = RevisionId::next_generation(request.parent.as_ref());
        let digest = self.digest(
            "local",
            &request.doc_id,
            generation,
            &request.body,
            request.flags.deleted,
        );
        let body = if request.flags.deleted {
            serde_json::Value::Object(Default::default())
        } else {
            request.body
        };
        let revision = Revision {
            doc_id: request.doc_id,
            rev_id: RevisionId::new(generation, digest),
            parent: request.parent,
            body,
            flags: request.flags,
            sequence: self.sequence,
            origin: Origin::Local,
        };

        self.documents
            .entry(revision.doc_id.clone())
            .and_modify(|e| e.current = revision.clone())
            .or_insert_with(|| DocumentEntry {
                current: revision.clone(),
                conflicts: Vec::new(),
            });

        self.record_change(&revision, false);
        Ok(revision)
    }

    fn insert_remote_revision(
        &mut self,
        doc_id: &str,
        body: serde_json::Value,
        deleted: bool,
        parent: Option<RevisionId>,
    ) -> Result<Revision> {
        MemoryStore::insert_remote_revision(self, doc_id, body, deleted, parent)
    }

    fn next_conflicting_revision(&self, doc_id: &str) -> Result<Option<Revision>> {
        Ok(self
            .documents
            .get(doc_id)
            .and_then(|e| e.conflicts.first().cloned()))
    }

    fn resolve_conflict(
        &mut self,
        doc_id: &str,
        winning: &RevisionId,
        losing: &RevisionId,
        merged: Option<MergedRevision>,
    ) -> Result<Revision> {
        self.require_transaction()?;

        let entry = self
            .documents
            .get(doc_id)
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))?;
        if &entry.current.rev_id != losing {
            return Err(Error::Conflict(doc_id.to_string()));
        }
        let position = entry
            .conflicts
            .iter()
            .position(|r| &r.rev_id == winning)
            .ok_or_else(|| Error::Conflict(doc_id.to_string()))?;

        self.sequence += 1;
        let digest = merged.as_ref().map(|m| {
            self.digest(
                "merge",
                doc_id,
                winning.generation + 1,
                &m.body,
                m.flags.deleted,
            )
        });
        let sequence = self.sequence;

        let entry = self
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))?;
        let mut remote = entry.conflicts.remove(position);
        let resolved = match (merged, digest) {
            (Some(merged), Some(digest)) => Revision {
                doc_id: doc_id.to_string(),
                rev_id: remote.rev_id.child(digest),
                parent: Some(remote.rev_id.clone()),
                body: if merged.flags.deleted {
                    serde_json::Value::Object(Default::default())
                } else {
                    merged.body
                },
                flags: merged.flags,
                sequence,
                origin: Origin::Local,
            },
            _ => {
                remote.sequence = sequence;
                remote
            }
        };
        entry.current = resolved.clone();

        self.record_change(&resolved, false);
        Ok(resolved)
    }

    fn set_change_observer(&mut self, observer: Option<ChangeObserver>) {
        if observer.is_none() {
            self.pending_changes.clear();
        }
        self.observer = observer;
    }

    fn read_changes(&mut self, max: usize) -> ObservedChanges {
        let Some(external) = self.pending_changes.front().map(|c| c.external) else {
            return ObservedChanges::default();
        };

        let mut changes = Vec::new();
        while changes.len() < max {
            match self.pending_changes.front() {
                Some(next) if next.external == external => {
                    if let Some(change) = self.pending_changes.pop_front() {
                        changes.push(change);
                    }
                }
                _ => break,
            }
        }
        ObservedChanges { external, changes }
    }

    fn execute_query(&self, query: &Query) -> Result<QueryResults> {
        Ok(self.run_query(query))
    }

    fn refresh_query(&self, previous: &QueryResults) -> Result<Option<QueryResults>> {
        if previous.sequence() == self.sequence {
            return Ok(None);
        }
        let fresh = self.run_query(previous.query());
        if fresh.rows() == previous.rows() {
            Ok(None)
        } else {
            Ok(Some(fresh))
        }
    }

    fn document_count(&self) -> usize {
        self.documents
            .values()
            .filter(|e| !e.current.is_deleted())
            .count()
    }

    fn last_sequence(&self) -> Sequence {
        self.sequence
    }
}
