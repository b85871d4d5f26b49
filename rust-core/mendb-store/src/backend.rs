// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core repository trait for MendDB.
//
// Defines the `Repository` trait: the full set of datastore capabilities the
// detector and fixer rely on. Implementations are expected to be thread-safe
// (`Send + Sync`) and fully asynchronous. Callers never hold their own locks
// across these calls.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::record::{Filter, IndexSpec, Record, RecordGroup, RecordId};

/// A document datastore that can be inspected and repaired.
///
/// Ordering matters: `group_by` and `scan` must return records in the
/// repository's discovery order (insertion order for the in-memory backend)
/// because duplicate remediation keeps the first-discovered record.
#[async_trait]
pub trait Repository: Send + Sync {
    /// A human-readable name for this repository, used in logging.
    fn name(&self) -> &str;

    /// Connectivity probe. Returns [`StoreError::Unavailable`] when the
    /// datastore cannot be reached.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Names of all existing collections.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Number of records in `collection` (0 if it does not exist).
    async fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// Group records by the value of `field`.
    ///
    /// Groups appear in the order their key was first seen; ids within a group
    /// are in discovery order. Records whose field is blank are not grouped.
    async fn group_by(&self, collection: &str, field: &str)
        -> Result<Vec<RecordGroup>, StoreError>;

    /// Return records matching `filter`, up to `limit` if given.
    async fn scan(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Point read. Returns `Ok(None)` if the record does not exist.
    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, StoreError>;

    /// Insert a new record, creating the collection on first use.
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the id is already present.
    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError>;

    /// Overwrite a single field. Returns `Ok(false)` if no such record exists.
    async fn update_field(
        &self,
        collection: &str,
        id: &RecordId,
        field: &str,
        value: Value,
    ) -> Result<bool, StoreError>;

    /// Delete a record. Returns `Ok(false)` if it was not present.
    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool, StoreError>;

    /// Indexes defined on `collection`.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError>;

    /// Define an index on `collection`.
    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError>;
}
