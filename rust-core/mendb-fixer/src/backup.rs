// SPDX-License-Identifier: PMPL-1.0-or-later
//! Backup-before-fix.
//!
//! Copies the current state of each record a strategy is about to touch into
//! `<collection>_backups`, keyed by `<record id>@<timestamp>`. Best effort: the
//! caller logs a failure and carries on with the remediation.

use chrono::Utc;
use tracing::debug;

use mendb_state::AnomalyKind;
use mendb_store::{Record, RecordId, Repository};

use crate::FixError;

/// Suffix of the side collection backups are written to.
pub const BACKUP_SUFFIX: &str = "_backups";

/// Backup location for `collection`.
pub fn backup_collection(collection: &str) -> String {
    format!("{}{}", collection, BACKUP_SUFFIX)
}

/// Back up `ids` from `collection`. Records that no longer exist are skipped.
///
/// Returns the number of backups written.
pub async fn backup_records(
    repository: &dyn Repository,
    collection: &str,
    ids: &[RecordId],
    kind: AnomalyKind,
) -> Result<usize, FixError> {
    let destination = backup_collection(collection);
    let now = Utc::now();
    let stamp = now.format("%Y%m%dT%H%M%S%.6fZ").to_string();

    let mut written = 0;
    for id in ids {
        let Some(record) = repository.get(collection, id).await? else {
            debug!(collection, record = %id, "Record gone before backup, skipping");
            continue;
        };

        let mut backup = Record::new(format!("{}@{}", id, stamp));
        backup.fields = record.fields;
        let backup = backup
            .with_field("_backup_of", id.as_str())
            .with_field("_backed_up_at", now.to_rfc3339())
            .with_field("_anomaly_kind", kind.to_string());

        repository
            .insert(&destination, backup)
            .await
            .map_err(|e| FixError::Backup(format!("{}/{}: {}", collection, id, e)))?;
        written += 1;
    }

    debug!(collection, destination = %destination, written, "Backup complete");
    Ok(written)
}
