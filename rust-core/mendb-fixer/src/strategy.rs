// SPDX-License-Identifier: PMPL-1.0-or-later
//! Remediation strategies and the table that dispatches to them.
//!
//! Dispatch is a flat map from [`RemediationKind`] to a strategy object. An
//! anomaly whose kind has no entry fails with [`FixError::StrategyNotFound`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use mendb_state::{Anomaly, AnomalyContext, RemediationKind};
use mendb_store::{Record, RecordId, Repository, StoreError};

use crate::FixError;

/// Suffix of the collection orphans are moved into.
pub const ARCHIVE_SUFFIX: &str = "_orphaned";

/// Reason tag written on archived records.
pub const ARCHIVE_REASON: &str = "orphaned_document";

/// Archive location for `collection`.
pub fn archive_collection(collection: &str) -> String {
    format!("{}{}", collection, ARCHIVE_SUFFIX)
}

/// What a strategy did (or, in dry-run, would do) to one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeAction {
    Deleted,
    Archived { archive_collection: String },
    FieldSet { field: String, value: Value },
    IndexRecommended { field: String },
    /// The record was already gone
    AlreadyResolved,
}

/// A single change made during remediation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub collection: String,
    pub record_id: Option<RecordId>,
    pub action: ChangeAction,
}

impl Change {
    fn new(collection: &str, record_id: Option<RecordId>, action: ChangeAction) -> Self {
        Self {
            collection: collection.to_string(),
            record_id,
            action,
        }
    }
}

/// Remediation strategy trait
#[async_trait]
pub trait RemediationStrategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// The remediation kind this strategy handles
    fn kind(&self) -> RemediationKind;

    /// Whether `apply` writes to the repository. Non-mutating strategies are
    /// never preceded by a backup.
    fn mutates(&self) -> bool {
        true
    }

    /// Records in the anomaly's collection that `apply` may modify or delete.
    fn backup_targets(&self, anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError>;

    /// Changes `apply` would make, computed without touching the repository.
    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError>;

    /// Perform the remediation
    async fn apply(
        &self,
        repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError>;
}

fn mismatch(strategy: &str, anomaly: &Anomaly) -> FixError {
    FixError::ContextMismatch {
        strategy: strategy.to_string(),
        anomaly: anomaly.id().clone(),
    }
}

fn target_record(anomaly: &Anomaly) -> Result<&RecordId, FixError> {
    anomaly
        .target()
        .record_id
        .as_ref()
        .ok_or_else(|| FixError::MissingTarget(anomaly.id().clone()))
}

/// Keep the first-discovered record of a duplicate group, delete the rest.
///
/// "First" is the detector's discovery order; no business timestamp is
/// consulted.
pub struct RemoveDuplicatesStrategy;

impl RemoveDuplicatesStrategy {
    fn extras<'a>(&self, anomaly: &'a Anomaly) -> Result<&'a [RecordId], FixError> {
        match anomaly.context() {
            AnomalyContext::Duplicate { ids, .. } if !ids.is_empty() => Ok(&ids[1..]),
            _ => Err(mismatch(self.name(), anomaly)),
        }
    }
}

#[async_trait]
impl RemediationStrategy for RemoveDuplicatesStrategy {
    fn name(&self) -> &str {
        "remove-duplicates"
    }

    fn kind(&self) -> RemediationKind {
        RemediationKind::RemoveDuplicates
    }

    fn backup_targets(&self, anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError> {
        Ok(self.extras(anomaly)?.to_vec())
    }

    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        Ok(self
            .extras(anomaly)?
            .iter()
            .map(|id| Change::new(collection, Some(id.clone()), ChangeAction::Deleted))
            .collect())
    }

    async fn apply(
        &self,
        repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        let mut changes = Vec::new();
        for id in self.extras(anomaly)? {
            let action = if repository.delete(collection, id).await? {
                ChangeAction::Deleted
            } else {
                ChangeAction::AlreadyResolved
            };
            changes.push(Change::new(collection, Some(id.clone()), action));
        }
        Ok(changes)
    }
}

/// Move an orphaned record into `<collection>_orphaned`.
pub struct ArchiveOrphanStrategy;

#[async_trait]
impl RemediationStrategy for ArchiveOrphanStrategy {
    fn name(&self) -> &str {
        "archive-orphan"
    }

    fn kind(&self) -> RemediationKind {
        RemediationKind::ArchiveOrphan
    }

    fn backup_targets(&self, anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError> {
        Ok(vec![target_record(anomaly)?.clone()])
    }

    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        Ok(vec![Change::new(
            collection,
            Some(target_record(anomaly)?.clone()),
            ChangeAction::Archived {
                archive_collection: archive_collection(collection),
            },
        )])
    }

    async fn apply(
        &self,
        repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        let id = target_record(anomaly)?;

        let Some(record) = repository.get(collection, id).await? else {
            debug!(collection = %collection, record = %id, "Orphan already gone");
            return Ok(vec![Change::new(
                collection,
                Some(id.clone()),
                ChangeAction::AlreadyResolved,
            )]);
        };

        let archive = archive_collection(collection);
        let archived = record
            .clone()
            .with_field("_archived_at", Utc::now().to_rfc3339())
            .with_field("_archive_reason", ARCHIVE_REASON);
        match repository.insert(&archive, archived).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                // Only an identical copy means an earlier attempt stopped
                // between insert and delete
                let existing = repository.get(&archive, id).await?;
                if !existing.is_some_and(|copy| same_document(&copy, &record)) {
                    warn!(
                        collection = %archive,
                        record = %id,
                        "Archive holds a different record with this id, leaving original in place"
                    );
                    return Err(FixError::ArchiveConflict {
                        collection: archive,
                        id: id.clone(),
                    });
                }
                debug!(collection = %archive, record = %id, "Archive copy already present");
            }
            Err(e) => return Err(e.into()),
        }
        repository.delete(collection, id).await?;

        Ok(vec![Change::new(
            collection,
            Some(id.clone()),
            ChangeAction::Archived {
                archive_collection: archive,
            },
        )])
    }
}

/// Whether an archived copy holds the same fields as `live`, ignoring the
/// archive tags.
fn same_document(copy: &Record, live: &Record) -> bool {
    let mut fields = copy.fields.clone();
    fields.remove("_archived_at");
    fields.remove("_archive_reason");
    fields == live.fields
}

/// Delete a record that lacks a required field.
pub struct DeleteIncompleteStrategy;

#[async_trait]
impl RemediationStrategy for DeleteIncompleteStrategy {
    fn name(&self) -> &str {
        "delete-incomplete"
    }

    fn kind(&self) -> RemediationKind {
        RemediationKind::DeleteIncomplete
    }

    fn backup_targets(&self, anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError> {
        Ok(vec![target_record(anomaly)?.clone()])
    }

    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError> {
        Ok(vec![Change::new(
            &anomaly.target().collection,
            Some(target_record(anomaly)?.clone()),
            ChangeAction::Deleted,
        )])
    }

    async fn apply(
        &self,
        repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        let id = target_record(anomaly)?;
        let action = if repository.delete(collection, id).await? {
            ChangeAction::Deleted
        } else {
            ChangeAction::AlreadyResolved
        };
        Ok(vec![Change::new(collection, Some(id.clone()), action)])
    }
}

/// Overwrite an out-of-domain field with the rule's default.
pub struct CoerceToDefaultStrategy;

impl CoerceToDefaultStrategy {
    fn field_and_default<'a>(&self, anomaly: &'a Anomaly) -> Result<(&'a str, &'a Value), FixError> {
        match anomaly.context() {
            AnomalyContext::InvalidValue { field, default, .. } => Ok((field.as_str(), default)),
            _ => Err(mismatch(self.name(), anomaly)),
        }
    }
}

#[async_trait]
impl RemediationStrategy for CoerceToDefaultStrategy {
    fn name(&self) -> &str {
        "coerce-to-default"
    }

    fn kind(&self) -> RemediationKind {
        RemediationKind::CoerceToDefault
    }

    fn backup_targets(&self, anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError> {
        Ok(vec![target_record(anomaly)?.clone()])
    }

    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError> {
        let (field, default) = self.field_and_default(anomaly)?;
        Ok(vec![Change::new(
            &anomaly.target().collection,
            Some(target_record(anomaly)?.clone()),
            ChangeAction::FieldSet {
                field: field.to_string(),
                value: default.clone(),
            },
        )])
    }

    async fn apply(
        &self,
        repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError> {
        let collection = &anomaly.target().collection;
        let id = target_record(anomaly)?;
        let (field, default) = self.field_and_default(anomaly)?;

        let action = if repository
            .update_field(collection, id, field, default.clone())
            .await?
        {
            ChangeAction::FieldSet {
                field: field.to_string(),
                value: default.clone(),
            }
        } else {
            ChangeAction::AlreadyResolved
        };
        Ok(vec![Change::new(collection, Some(id.clone()), action)])
    }
}

/// Emit an index recommendation. Never creates the index.
pub struct RecommendIndexStrategy;

impl RecommendIndexStrategy {
    fn field<'a>(&self, anomaly: &'a Anomaly) -> Result<&'a str, FixError> {
        match anomaly.context() {
            AnomalyContext::MissingIndex { field, .. } => Ok(field.as_str()),
            _ => Err(mismatch(self.name(), anomaly)),
        }
    }
}

#[async_trait]
impl RemediationStrategy for RecommendIndexStrategy {
    fn name(&self) -> &str {
        "recommend-index"
    }

    fn kind(&self) -> RemediationKind {
        RemediationKind::RecommendIndex
    }

    fn mutates(&self) -> bool {
        false
    }

    fn backup_targets(&self, _anomaly: &Anomaly) -> Result<Vec<RecordId>, FixError> {
        Ok(Vec::new())
    }

    fn plan(&self, anomaly: &Anomaly) -> Result<Vec<Change>, FixError> {
        Ok(vec![Change::new(
            &anomaly.target().collection,
            None,
            ChangeAction::IndexRecommended {
                field: self.field(anomaly)?.to_string(),
            },
        )])
    }

    async fn apply(
        &self,
        _repository: &dyn Repository,
        anomaly: &Anomaly,
    ) -> Result<Vec<Change>, FixError> {
        let field = self.field(anomaly)?;
        info!(
            collection = %anomaly.target().collection,
            field,
            index = %format!("{}_1", field),
            "Index recommended"
        );
        self.plan(anomaly)
    }
}

/// Flat dispatch table from remediation kind to strategy.
#[derive(Clone, Default)]
pub struct StrategyTable {
    strategies: HashMap<RemediationKind, Arc<dyn RemediationStrategy>>,
}

impl StrategyTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with one built-in strategy per remediation kind
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(Arc::new(RemoveDuplicatesStrategy));
        table.register(Arc::new(ArchiveOrphanStrategy));
        table.register(Arc::new(DeleteIncompleteStrategy));
        table.register(Arc::new(CoerceToDefaultStrategy));
        table.register(Arc::new(RecommendIndexStrategy));
        table
    }

    /// Register a strategy under its own kind, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn RemediationStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn remove(&mut self, kind: RemediationKind) -> Option<Arc<dyn RemediationStrategy>> {
        self.strategies.remove(&kind)
    }

    pub fn get(&self, kind: RemediationKind) -> Option<Arc<dyn RemediationStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    /// Strategy names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .strategies
            .values()
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names
    }
}
