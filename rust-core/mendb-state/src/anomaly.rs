// SPDX-License-Identifier: PMPL-1.0-or-later
//! Anomaly taxonomy and the anomaly record itself.
//!
//! An [`Anomaly`] is created by a detector check, travels through the queue,
//! is remediated by the fixer and finally archived in the shared state's
//! recent lists. Every field is fixed at construction; the only later write is
//! the single fix completion, which [`Anomaly::complete`] refuses to repeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use mendb_store::RecordId;

use crate::StateError;

/// Unique identifier for an anomaly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AnomalyId(pub String);

impl AnomalyId {
    /// Generate a new UUID-based ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnomalyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured identity of a finding: kind, collection, record id or group
/// key, and field. Compared part by part, so separators inside ids or
/// collection names cannot make two findings collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: AnomalyKind,
    pub collection: String,
    pub subject: Option<String>,
    pub field: Option<String>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind,
            self.collection,
            self.subject.as_deref().unwrap_or("-"),
            self.field.as_deref().unwrap_or("-")
        )
    }
}

/// Kinds of data-integrity anomaly the detector can find
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Several records share a value that should be unique
    DuplicateRecord,
    /// A child record references a parent that does not exist
    OrphanedDocument,
    /// A required field is absent, null or empty
    MissingField,
    /// An enumerated field holds a value outside its domain
    InvalidData,
    /// A large collection lacks an index on a hot field
    SlowQuery,
}

impl AnomalyKind {
    /// Display/prioritization hint; drives no logic.
    pub fn default_severity(self) -> Severity {
        match self {
            AnomalyKind::DuplicateRecord => Severity::Medium,
            AnomalyKind::OrphanedDocument => Severity::High,
            AnomalyKind::MissingField => Severity::High,
            AnomalyKind::InvalidData => Severity::Medium,
            AnomalyKind::SlowQuery => Severity::Low,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::DuplicateRecord => write!(f, "duplicate_record"),
            AnomalyKind::OrphanedDocument => write!(f, "orphaned_document"),
            AnomalyKind::MissingField => write!(f, "missing_field"),
            AnomalyKind::InvalidData => write!(f, "invalid_data"),
            AnomalyKind::SlowQuery => write!(f, "slow_query"),
        }
    }
}

/// Severity levels for anomalies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Tag selecting the fixer strategy for an anomaly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    /// Keep the first-discovered record, delete the rest
    RemoveDuplicates,
    /// Move the record into the archive collection
    ArchiveOrphan,
    /// Delete the incomplete record
    DeleteIncomplete,
    /// Overwrite the offending field with the domain default
    CoerceToDefault,
    /// Log an index recommendation; no mutation
    RecommendIndex,
}

impl RemediationKind {
    pub const ALL: [RemediationKind; 5] = [
        RemediationKind::RemoveDuplicates,
        RemediationKind::ArchiveOrphan,
        RemediationKind::DeleteIncomplete,
        RemediationKind::CoerceToDefault,
        RemediationKind::RecommendIndex,
    ];
}

impl fmt::Display for RemediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationKind::RemoveDuplicates => write!(f, "remove_duplicates"),
            RemediationKind::ArchiveOrphan => write!(f, "archive_orphan"),
            RemediationKind::DeleteIncomplete => write!(f, "delete_incomplete"),
            RemediationKind::CoerceToDefault => write!(f, "coerce_to_default"),
            RemediationKind::RecommendIndex => write!(f, "recommend_index"),
        }
    }
}

/// Where the affected data lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    /// Collection holding the affected records
    pub collection: String,
    /// The affected record, for single-record anomalies
    pub record_id: Option<RecordId>,
    /// The field the anomaly is about, if any
    pub field: Option<String>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnomalyContext {
    Duplicate {
        field: String,
        value: Value,
        count: usize,
        /// All colliding records in discovery order; the first one survives.
        ids: Vec<RecordId>,
    },
    Orphan {
        foreign_key: String,
        value: Value,
        parent_collection: String,
        parent_key: String,
    },
    MissingField {
        field: String,
    },
    InvalidValue {
        field: String,
        observed: Option<Value>,
        allowed: Vec<Value>,
        default: Value,
    },
    MissingIndex {
        field: String,
        document_count: u64,
        threshold: u64,
    },
}

/// The single fix-completion write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixOutcome {
    pub fixed_at: DateTime<Utc>,
    pub succeeded: bool,
}

/// A detected data-integrity issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    id: AnomalyId,
    kind: AnomalyKind,
    severity: Severity,
    target: Target,
    context: AnomalyContext,
    description: String,
    detected_at: DateTime<Utc>,
    remediation: RemediationKind,
    outcome: Option<FixOutcome>,
}

impl Anomaly {
    fn new(
        kind: AnomalyKind,
        target: Target,
        context: AnomalyContext,
        remediation: RemediationKind,
        description: String,
    ) -> Self {
        Self {
            id: AnomalyId::generate(),
            kind,
            severity: kind.default_severity(),
            target,
            context,
            description,
            detected_at: Utc::now(),
            remediation,
            outcome: None,
        }
    }

    /// Several records in `collection` share `value` on `field`.
    pub fn duplicate(
        collection: impl Into<String>,
        field: impl Into<String>,
        value: Value,
        ids: Vec<RecordId>,
    ) -> Self {
        let field = field.into();
        let count = ids.len();
        let description = format!(
            "Duplicate {} '{}' found {} times",
            field,
            display_value(&value),
            count
        );
        Self::new(
            AnomalyKind::DuplicateRecord,
            Target {
                collection: collection.into(),
                record_id: None,
                field: Some(field.clone()),
            },
            AnomalyContext::Duplicate {
                field,
                value,
                count,
                ids,
            },
            RemediationKind::RemoveDuplicates,
            description,
        )
    }

    /// A child record whose foreign key matches no parent.
    pub fn orphan(
        collection: impl Into<String>,
        record_id: RecordId,
        foreign_key: impl Into<String>,
        value: Value,
        parent_collection: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        let collection = collection.into();
        let parent_collection = parent_collection.into();
        let foreign_key = foreign_key.into();
        let description = format!(
            "Record {} in {} references non-existent {} '{}'",
            record_id,
            collection,
            parent_collection,
            display_value(&value)
        );
        Self::new(
            AnomalyKind::OrphanedDocument,
            Target {
                collection,
                record_id: Some(record_id),
                field: Some(foreign_key.clone()),
            },
            AnomalyContext::Orphan {
                foreign_key,
                value,
                parent_collection,
                parent_key: parent_key.into(),
            },
            RemediationKind::ArchiveOrphan,
            description,
        )
    }

    /// A record lacking a required field.
    pub fn missing_field(
        collection: impl Into<String>,
        record_id: RecordId,
        field: impl Into<String>,
    ) -> Self {
        let collection = collection.into();
        let field = field.into();
        let description = format!(
            "Record {} in {} is missing required field '{}'",
            record_id, collection, field
        );
        Self::new(
            AnomalyKind::MissingField,
            Target {
                collection,
                record_id: Some(record_id),
                field: Some(field.clone()),
            },
            AnomalyContext::MissingField { field },
            RemediationKind::DeleteIncomplete,
            description,
        )
    }

    /// A record whose enumerated field is outside its allowed set.
    pub fn invalid_value(
        collection: impl Into<String>,
        record_id: RecordId,
        field: impl Into<String>,
        observed: Option<Value>,
        allowed: Vec<Value>,
        default: Value,
    ) -> Self {
        let collection = collection.into();
        let field = field.into();
        let shown = observed
            .as_ref()
            .map(display_value)
            .unwrap_or_else(|| "<absent>".to_string());
        let description = format!(
            "Record {} in {} has invalid {} '{}'",
            record_id, collection, field, shown
        );
        Self::new(
            AnomalyKind::InvalidData,
            Target {
                collection,
                record_id: Some(record_id),
                field: Some(field.clone()),
            },
            AnomalyContext::InvalidValue {
                field,
                observed,
                allowed,
                default,
            },
            RemediationKind::CoerceToDefault,
            description,
        )
    }

    /// A large collection with no index covering a recommended field.
    pub fn missing_index(
        collection: impl Into<String>,
        field: impl Into<String>,
        document_count: u64,
        threshold: u64,
    ) -> Self {
        let collection = collection.into();
        let field = field.into();
        let description = format!(
            "No index on {}.{} ({} documents, threshold {})",
            collection, field, document_count, threshold
        );
        Self::new(
            AnomalyKind::SlowQuery,
            Target {
                collection,
                record_id: None,
                field: Some(field.clone()),
            },
            AnomalyContext::MissingIndex {
                field,
                document_count,
                threshold,
            },
            RemediationKind::RecommendIndex,
            description,
        )
    }

    pub fn id(&self) -> &AnomalyId {
        &self.id
    }

    pub fn kind(&self) -> AnomalyKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn context(&self) -> &AnomalyContext {
        &self.context
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn remediation(&self) -> RemediationKind {
        self.remediation
    }

    pub fn outcome(&self) -> Option<FixOutcome> {
        self.outcome
    }

    /// `fixed_at`, once the fixer has completed this anomaly.
    pub fn fixed_at(&self) -> Option<DateTime<Utc>> {
        self.outcome.map(|o| o.fixed_at)
    }

    /// `fix_succeeded`, once the fixer has completed this anomaly.
    pub fn fix_succeeded(&self) -> Option<bool> {
        self.outcome.map(|o| o.succeeded)
    }

    /// Identity of the finding, independent of when it was detected.
    ///
    /// Two detections of the same problem on the same data share a
    /// fingerprint; used to avoid queueing a finding that is already pending.
    pub fn fingerprint(&self) -> Fingerprint {
        let subject = match (&self.target.record_id, &self.context) {
            (Some(id), _) => Some(id.to_string()),
            (None, AnomalyContext::Duplicate { value, .. }) => Some(value.to_string()),
            (None, _) => None,
        };
        Fingerprint {
            kind: self.kind,
            collection: self.target.collection.clone(),
            subject,
            field: self.target.field.clone(),
        }
    }

    /// Record the fix outcome. Allowed exactly once.
    pub fn complete(&mut self, succeeded: bool) -> Result<(), StateError> {
        if self.outcome.is_some() {
            return Err(StateError::AlreadyCompleted(self.id.clone()));
        }
        self.outcome = Some(FixOutcome {
            fixed_at: Utc::now(),
            succeeded,
        });
        Ok(())
    }
}

/// Strings render without JSON quotes, everything else as JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
