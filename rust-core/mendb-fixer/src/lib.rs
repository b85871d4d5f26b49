// SPDX-License-Identifier: PMPL-1.0-or-later
//! MendDB Fixer
//!
//! Self-healing engine. Drains the anomaly queue one item at a time, backs up
//! what is about to change, dispatches to the strategy registered for the
//! anomaly's remediation kind, and records the outcome in the shared state.

use chrono::{DateTime, Utc};
use prometheus::{IntCounterVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mendb_state::{Anomaly, AnomalyId, AnomalyKind, RemediationKind, SharedState, StateError};
use mendb_store::{RecordId, Repository, StoreError};

mod backup;
mod strategy;

pub use backup::{backup_collection, backup_records, BACKUP_SUFFIX};
pub use strategy::{
    archive_collection, ArchiveOrphanStrategy, Change, ChangeAction, CoerceToDefaultStrategy,
    DeleteIncompleteStrategy, RecommendIndexStrategy, RemediationStrategy,
    RemoveDuplicatesStrategy, StrategyTable, ARCHIVE_REASON, ARCHIVE_SUFFIX,
};

/// Default pause after each remediation.
pub const DEFAULT_FIX_PACING: Duration = Duration::from_secs(2);

/// Default pause when the queue is empty.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// Fixer errors
#[derive(Error, Debug)]
pub enum FixError {
    #[error("Repository error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("No strategy registered for {0}")]
    StrategyNotFound(RemediationKind),

    #[error("Auto-fix is disabled")]
    AutoFixDisabled,

    #[error("Strategy {strategy} cannot handle anomaly {anomaly}")]
    ContextMismatch { strategy: String, anomaly: AnomalyId },

    #[error("Anomaly {0} does not name a record")]
    MissingTarget(AnomalyId),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("{collection} already holds a different record {id}")]
    ArchiveConflict { collection: String, id: RecordId },

    #[error("Metrics registration failed: {0}")]
    Metrics(String),
}

/// Configuration for the fixer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Run strategies at all; when off every anomaly is marked failed
    pub auto_fix: bool,
    /// Simulate strategies and report success without mutating
    pub dry_run: bool,
    /// Copy records to `<collection>_backups` before mutating them
    pub backup_before_fix: bool,
    /// Pause after each remediation
    #[serde(with = "duration_ms")]
    pub pacing: Duration,
    /// Pause when the queue is empty
    #[serde(with = "duration_ms")]
    pub idle_interval: Duration,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            auto_fix: true,
            dry_run: false,
            backup_before_fix: true,
            pacing: DEFAULT_FIX_PACING,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

/// Result of a successful (or simulated) remediation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationReport {
    /// Strategy that ran
    pub strategy: String,
    /// Changes made, or planned in dry-run
    pub changes: Vec<Change>,
    /// Backups written before the strategy ran
    pub backups: usize,
    pub duration_ms: u64,
    /// True in dry-run mode
    pub simulated: bool,
    pub completed_at: DateTime<Utc>,
}

/// One pass of the fixer over a single anomaly.
#[derive(Debug)]
pub struct FixAttempt {
    pub anomaly_id: AnomalyId,
    pub kind: AnomalyKind,
    pub result: Result<RemediationReport, FixError>,
}

impl FixAttempt {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// The remediation worker
pub struct Fixer {
    repository: Arc<dyn Repository>,
    state: Arc<SharedState>,
    config: FixerConfig,
    strategies: StrategyTable,
    fixes: Option<IntCounterVec>,
}

impl Fixer {
    /// Create a fixer with the built-in strategy table
    pub fn new(
        repository: Arc<dyn Repository>,
        state: Arc<SharedState>,
        config: FixerConfig,
    ) -> Self {
        Self {
            repository,
            state,
            config,
            strategies: StrategyTable::with_defaults(),
            fixes: None,
        }
    }

    /// Create with default config
    pub fn with_defaults(repository: Arc<dyn Repository>, state: Arc<SharedState>) -> Self {
        Self::new(repository, state, FixerConfig::default())
    }

    /// Replace the strategy table
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    /// Register Prometheus metrics
    pub fn with_prometheus(mut self, registry: &Registry) -> Result<Self, FixError> {
        let fixes = IntCounterVec::new(
            Opts::new("mendb_fixes_total", "Remediation attempts by outcome"),
            &["kind", "outcome"],
        )
        .map_err(|e| FixError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(fixes.clone()))
            .map_err(|e| FixError::Metrics(e.to_string()))?;
        self.fixes = Some(fixes);
        Ok(self)
    }

    pub fn config(&self) -> &FixerConfig {
        &self.config
    }

    /// Registered strategy names
    pub fn strategies(&self) -> Vec<String> {
        self.strategies.names()
    }

    /// Remediate one anomaly without touching the shared state.
    pub async fn execute(&self, anomaly: &Anomaly) -> Result<RemediationReport, FixError> {
        let start = Instant::now();
        let kind = anomaly.remediation();

        if !self.config.dry_run && !self.config.auto_fix {
            return Err(FixError::AutoFixDisabled);
        }
        let strategy = self
            .strategies
            .get(kind)
            .ok_or(FixError::StrategyNotFound(kind))?;

        if self.config.dry_run {
            let changes = strategy.plan(anomaly)?;
            info!(
                anomaly = %anomaly.id(),
                strategy = strategy.name(),
                planned = changes.len(),
                "Dry run, no changes made"
            );
            return Ok(RemediationReport {
                strategy: strategy.name().to_string(),
                changes,
                backups: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                simulated: true,
                completed_at: Utc::now(),
            });
        }

        let mut backups = 0;
        if self.config.backup_before_fix && strategy.mutates() {
            let collection = &anomaly.target().collection;
            let targets = strategy.backup_targets(anomaly)?;
            match backup_records(self.repository.as_ref(), collection, &targets, anomaly.kind())
                .await
            {
                Ok(written) => backups = written,
                Err(e) => warn!(
                    anomaly = %anomaly.id(),
                    collection = %collection,
                    error = %e,
                    "Backup failed, continuing with remediation"
                ),
            }
        }

        let changes = strategy.apply(self.repository.as_ref(), anomaly).await?;
        Ok(RemediationReport {
            strategy: strategy.name().to_string(),
            changes,
            backups,
            duration_ms: start.elapsed().as_millis() as u64,
            simulated: false,
            completed_at: Utc::now(),
        })
    }

    /// Take the next queued anomaly, remediate it and record the outcome.
    ///
    /// Returns `Ok(None)` when the queue is empty. A failed remediation is an
    /// `Ok` attempt whose `result` is the error; only a shared-state failure
    /// surfaces as `Err`.
    pub async fn fix_one(&self) -> Result<Option<FixAttempt>, FixError> {
        let Some(anomaly) = self.state.take_for_fix()? else {
            return Ok(None);
        };
        debug!(anomaly = %anomaly.id(), kind = %anomaly.kind(), "Fixing anomaly");

        let result = self.execute(&anomaly).await;
        let outcome = match &result {
            Ok(report) => {
                info!(
                    anomaly = %anomaly.id(),
                    kind = %anomaly.kind(),
                    strategy = %report.strategy,
                    changes = report.changes.len(),
                    backups = report.backups,
                    duration_ms = report.duration_ms,
                    simulated = report.simulated,
                    "{}",
                    anomaly.description()
                );
                if report.simulated {
                    "simulated"
                } else {
                    "fixed"
                }
            }
            Err(e) => {
                warn!(
                    anomaly = %anomaly.id(),
                    kind = %anomaly.kind(),
                    error = %e,
                    "Remediation failed"
                );
                "failed"
            }
        };
        if let Some(ref fixes) = self.fixes {
            let kind = anomaly.kind().to_string();
            fixes.with_label_values(&[kind.as_str(), outcome]).inc();
        }

        let attempt = FixAttempt {
            anomaly_id: anomaly.id().clone(),
            kind: anomaly.kind(),
            result,
        };
        self.state.record_fix_outcome(anomaly, attempt.succeeded())?;
        Ok(Some(attempt))
    }

    /// Drain the queue until `shutdown` turns true.
    ///
    /// Sleeps `pacing` after each anomaly and `idle_interval` when the queue is
    /// empty. Both sleeps end early on shutdown; a remediation in progress
    /// always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            auto_fix = self.config.auto_fix,
            dry_run = self.config.dry_run,
            backup_before_fix = self.config.backup_before_fix,
            pacing_ms = self.config.pacing.as_millis() as u64,
            "Fixer loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.fix_one().await {
                Ok(Some(_)) => self.config.pacing,
                Ok(None) => self.config.idle_interval,
                Err(e) => {
                    error!(error = %e, "Fixer iteration aborted");
                    self.config.idle_interval
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Fixer loop stopped");
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mendb_state::{FixerStatus, SharedState};
    use mendb_store::{Filter, InMemoryRepository, IndexSpec, Record, RecordGroup, RecordId};
    use prometheus::{Encoder, TextEncoder};
    use serde_json::{json, Value};

    /// Repository whose backup collections reject every write.
    struct BrokenBackups(InMemoryRepository);

    #[async_trait]
    impl Repository for BrokenBackups {
        fn name(&self) -> &str {
            "broken-backups"
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            self.0.list_collections().await
        }
        async fn count(&self, collection: &str) -> Result<u64, StoreError> {
            self.0.count(collection).await
        }
        async fn group_by(&self, collection: &str, field: &str) -> Result<Vec<RecordGroup>, StoreError> {
            self.0.group_by(collection, field).await
        }
        async fn scan(
            &self,
            collection: &str,
            filter: &Filter,
            limit: Option<usize>,
        ) -> Result<Vec<Record>, StoreError> {
            self.0.scan(collection, filter, limit).await
        }
        async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, StoreError> {
            self.0.get(collection, id).await
        }
        async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
            if collection.ends_with(BACKUP_SUFFIX) {
                return Err(StoreError::Query("backup store is read-only".to_string()));
            }
            self.0.insert(collection, record).await
        }
        async fn update_field(
            &self,
            collection: &str,
            id: &RecordId,
            field: &str,
            value: Value,
        ) -> Result<bool, StoreError> {
            self.0.update_field(collection, id, field, value).await
        }
        async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool, StoreError> {
            self.0.delete(collection, id).await
        }
        async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
            self.0.list_indexes(collection).await
        }
        async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
            self.0.create_index(collection, index).await
        }
    }

    async fn users_repo() -> InMemoryRepository {
        let repo = InMemoryRepository::new();
        repo.insert_documents(
            "users",
            vec![
                json!({"_id": "u1", "email": "a@x.com", "name": "A1"}),
                json!({"_id": "u2", "email": "a@x.com", "name": "A2"}),
                json!({"_id": "u3", "email": "a@x.com", "name": "A3"}),
                json!({"_id": "u4", "name": "NoEmail"}),
            ],
        )
        .await
        .unwrap();
        repo
    }

    fn duplicate() -> Anomaly {
        Anomaly::duplicate(
            "users",
            "email",
            json!("a@x.com"),
            vec!["u1".into(), "u2".into(), "u3".into()],
        )
    }

    fn state_with(anomalies: Vec<Anomaly>) -> Arc<SharedState> {
        let state = Arc::new(SharedState::with_defaults().unwrap());
        for anomaly in anomalies {
            state.record_detected(anomaly).unwrap();
        }
        state
    }

    fn quick(config: FixerConfig) -> FixerConfig {
        FixerConfig {
            pacing: Duration::from_millis(1),
            idle_interval: Duration::from_millis(1),
            ..config
        }
    }

    #[tokio::test]
    async fn test_fix_one_on_empty_queue() {
        let fixer = Fixer::with_defaults(Arc::new(InMemoryRepository::new()), state_with(vec![]));
        assert!(fixer.fix_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicates_removed_with_backups() {
        let repo = users_repo().await;
        let state = state_with(vec![duplicate()]);
        let fixer = Fixer::with_defaults(Arc::new(repo.clone()), state.clone());

        let attempt = fixer.fix_one().await.unwrap().unwrap();
        let report = attempt.result.unwrap();
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.backups, 2);
        assert!(!report.simulated);

        let users = repo.records("users").await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, RecordId::new("u1"));
        let backups = repo.records("users_backups").await;
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().all(|b| b.field("_backup_of") != Some(&json!("u1"))));

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.fixed, 1);
        assert!(snap.in_flight.is_none());
        assert_eq!(snap.health.fixer_status, FixerStatus::Idle);
        assert_eq!(snap.recent_fixed[0].fix_succeeded(), Some(true));
    }

    #[tokio::test]
    async fn test_no_backup_when_disabled() {
        let repo = users_repo().await;
        let fixer = Fixer::new(
            Arc::new(repo.clone()),
            state_with(vec![duplicate()]),
            FixerConfig {
                backup_before_fix: false,
                ..FixerConfig::default()
            },
        );
        fixer.fix_one().await.unwrap().unwrap().result.unwrap();
        assert!(repo.records("users_backups").await.is_empty());
        assert_eq!(repo.count("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block() {
        let repo = users_repo().await;
        let fixer = Fixer::with_defaults(
            Arc::new(BrokenBackups(repo.clone())),
            state_with(vec![duplicate()]),
        );
        let report = fixer.fix_one().await.unwrap().unwrap().result.unwrap();
        assert_eq!(report.backups, 0);
        assert_eq!(repo.count("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recommendation_writes_no_backup() {
        let repo = users_repo().await;
        let fixer = Fixer::with_defaults(
            Arc::new(repo.clone()),
            state_with(vec![Anomaly::missing_index("users", "email", 500, 100)]),
        );
        let attempt = fixer.fix_one().await.unwrap().unwrap();
        assert!(attempt.succeeded());
        assert_eq!(repo.list_collections().await.unwrap(), vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_repository_untouched() {
        let repo = users_repo().await;
        let before = repo.dump().await;
        let state = state_with(vec![
            duplicate(),
            Anomaly::missing_field("users", "u4".into(), "email"),
        ]);
        let fixer = Fixer::new(
            Arc::new(repo.clone()),
            state.clone(),
            FixerConfig {
                dry_run: true,
                ..FixerConfig::default()
            },
        );

        while let Some(attempt) = fixer.fix_one().await.unwrap() {
            let report = attempt.result.unwrap();
            assert!(report.simulated);
            assert!(!report.changes.is_empty());
        }

        assert_eq!(repo.dump().await, before);
        assert_eq!(state.snapshot().unwrap().statistics.fixed, 2);
    }

    #[tokio::test]
    async fn test_auto_fix_disabled_marks_failed() {
        let repo = users_repo().await;
        let before = repo.dump().await;
        let state = state_with(vec![duplicate()]);
        let fixer = Fixer::new(
            Arc::new(repo.clone()),
            state.clone(),
            FixerConfig {
                auto_fix: false,
                ..FixerConfig::default()
            },
        );

        let attempt = fixer.fix_one().await.unwrap().unwrap();
        assert!(matches!(attempt.result, Err(FixError::AutoFixDisabled)));
        assert_eq!(repo.dump().await, before);

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.failed, 1);
        assert!(snap.recent_fixed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_strategy_fails_item_not_loop() {
        let repo = users_repo().await;
        let state = state_with(vec![
            duplicate(),
            Anomaly::missing_field("users", "u4".into(), "email"),
        ]);
        let mut table = StrategyTable::with_defaults();
        table.remove(RemediationKind::RemoveDuplicates);
        let fixer = Fixer::with_defaults(Arc::new(repo.clone()), state.clone()).with_strategies(table);

        let first = fixer.fix_one().await.unwrap().unwrap();
        assert!(matches!(
            first.result,
            Err(FixError::StrategyNotFound(RemediationKind::RemoveDuplicates))
        ));
        let second = fixer.fix_one().await.unwrap().unwrap();
        assert!(second.succeeded());

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.failed, 1);
        assert_eq!(snap.statistics.fixed, 1);
        assert!(repo.get("users", &"u4".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repository_error_marks_failed() {
        let repo = users_repo().await;
        let state = state_with(vec![duplicate()]);
        let fixer = Fixer::with_defaults(Arc::new(repo.clone()), state.clone());
        repo.set_available(false);

        let attempt = fixer.fix_one().await.unwrap().unwrap();
        assert!(matches!(attempt.result, Err(FixError::Store(_))));
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.failed, 1);
        assert!(snap.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_prometheus_outcomes() {
        let registry = Registry::new();
        let repo = users_repo().await;
        let fixer = Fixer::with_defaults(Arc::new(repo), state_with(vec![duplicate()]))
            .with_prometheus(&registry)
            .unwrap();
        fixer.fix_one().await.unwrap();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("mendb_fixes_total{kind=\"duplicate_record\",outcome=\"fixed\"} 1"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let repo = users_repo().await;
        let state = state_with(vec![
            duplicate(),
            Anomaly::missing_field("users", "u4".into(), "email"),
        ]);
        let fixer = Arc::new(Fixer::new(
            Arc::new(repo.clone()),
            state.clone(),
            quick(FixerConfig::default()),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = {
            let fixer = Arc::clone(&fixer);
            tokio::spawn(async move { fixer.run(rx).await })
        };

        while state.snapshot().unwrap().statistics.fixed < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(repo.count("users").await.unwrap(), 1);
        assert_eq!(state.queue_depth(), 0);
    }

    #[test]
    fn test_config_json_uses_milliseconds() {
        let config: FixerConfig =
            serde_json::from_value(json!({"pacing": 250, "dry_run": true})).unwrap();
        assert_eq!(config.pacing, Duration::from_millis(250));
        assert_eq!(config.idle_interval, DEFAULT_IDLE_INTERVAL);
        assert!(config.dry_run);
        assert!(config.auto_fix);
    }
}
