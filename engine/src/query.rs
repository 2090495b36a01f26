//! Queries over current document revisions.
//!
//! Query construction is deliberately small: a single predicate on a body
//! field plus an optional limit. Results carry the database sequence they
//! were computed at, which lets [`crate::Storage::refresh_query`] answer
//! "did anything change" without re-running when nothing was committed.

use crate::{DocumentId, RevisionId, Sequence};
use serde::{Deserialize, Serialize};

/// Row filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Predicate {
    /// Every live document
    All,
    /// Field at `path` equals `value`
    Equals {
        path: String,
        value: serde_json::Value,
    },
    /// Field at `path` is present and not null
    Exists { path: String },
}

/// A query against a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    predicate: Predicate,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

impl Query {
    /// Match every live document.
    pub fn all() -> Self {
        Self {
            predicate: Predicate::All,
            limit: None,
        }
    }

    /// Match documents whose field at `path` (dot-separated) equals `value`.
    pub fn where_equals(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            predicate: Predicate::Equals {
                path: path.into(),
                value,
            },
            limit: None,
        }
    }

    /// Match documents that have a non-null field at `path`.
    pub fn where_exists(path: impl Into<String>) -> Self {
        Self {
            predicate: Predicate::Exists { path: path.into() },
            limit: None,
        }
    }

    /// Return at most `limit` rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The row filter.
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// The row limit, if any.
    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Check a body against the predicate.
    pub fn matches(&self, body: &serde_json::Value) -> bool {
        match &self.predicate {
            Predicate::All => true,
            Predicate::Equals { path, value } => lookup(body, path) == Some(value),
            Predicate::Exists { path } => lookup(body, path).is_some_and(|v| !v.is_null()),
        }
    }
}

fn lookup<'a>(body: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(body, |value, key| value.get(key))
}

/// One row of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub id: DocumentId,
    pub rev_id: RevisionId,
    pub body: serde_json::Value,
}

/// The rows a query produced at a given database sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    query: Query,
    rows: Vec<ResultRow>,
    sequence: Sequence,
}

impl QueryResults {
    pub(crate) fn new(query: Query, rows: Vec<ResultRow>, sequence: Sequence) -> Self {
        Self {
            query,
            rows,
            sequence,
        }
    }

    /// Query that produced these results.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Result rows, ordered by document id.
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Database sequence the results reflect.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Document ids in row order.
    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.id.as_str()).collect()
    }
}
