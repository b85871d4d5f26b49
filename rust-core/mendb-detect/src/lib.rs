// SPDX-License-Identifier: PMPL-1.0-or-later
//! MendDB Detection
//!
//! Runs a configurable set of integrity checks against a repository once per
//! cycle and feeds the findings into the shared state. This is the producer
//! half of the healing pipeline.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mendb_state::{Admission, SharedState, StateError};
use mendb_store::{Repository, StoreError};

mod checks;
mod config;

pub use checks::{
    default_checks, Check, CycleScope, DomainCheck, DuplicateCheck, IndexCheck,
    MissingFieldCheck, OrphanCheck,
};
pub use config::{
    DetectorConfig, DomainRule, EnabledChecks, IndexRule, ReferenceRule, RequiredRule,
    UniqueRule, DEFAULT_DETECTION_INTERVAL,
};

/// Detection errors
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Repository error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metrics registration failed: {0}")]
    Metrics(String),
}

/// Outcome of one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Attempt number, counting skipped cycles
    pub cycle: u64,
    /// Findings returned by all checks
    pub findings: usize,
    pub accepted: usize,
    pub suppressed: usize,
    pub overflowed: usize,
    /// Names of checks that returned an error
    pub failed_checks: Vec<String>,
    /// True when the repository was unreachable and no check ran
    pub skipped: bool,
}

struct DetectorMetrics {
    anomalies: IntCounterVec,
    cycles: IntCounter,
    check_failures: IntCounterVec,
}

/// Periodic anomaly detector
pub struct Detector {
    repository: Arc<dyn Repository>,
    state: Arc<SharedState>,
    config: DetectorConfig,
    checks: Vec<Arc<dyn Check>>,
    attempts: AtomicU64,
    metrics: Option<DetectorMetrics>,
}

impl Detector {
    /// Create a detector running the built-in checks enabled in `config`.
    pub fn new(
        repository: Arc<dyn Repository>,
        state: Arc<SharedState>,
        config: DetectorConfig,
    ) -> Self {
        let checks = default_checks(&config);
        Self {
            repository,
            state,
            config,
            checks,
            attempts: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Create with default config
    pub fn with_defaults(repository: Arc<dyn Repository>, state: Arc<SharedState>) -> Self {
        Self::new(repository, state, DetectorConfig::default())
    }

    /// Append a custom check; it runs after the built-in ones.
    pub fn with_check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    /// Register Prometheus metrics
    pub fn with_prometheus(mut self, registry: &Registry) -> Result<Self, DetectError> {
        let anomalies = IntCounterVec::new(
            Opts::new(
                "mendb_anomalies_detected_total",
                "Anomalies accepted into the queue",
            ),
            &["kind"],
        )
        .map_err(|e| DetectError::Metrics(e.to_string()))?;
        let cycles = IntCounter::new(
            "mendb_detection_cycles_total",
            "Completed detection cycles",
        )
        .map_err(|e| DetectError::Metrics(e.to_string()))?;
        let check_failures = IntCounterVec::new(
            Opts::new(
                "mendb_check_failures_total",
                "Checks that returned an error",
            ),
            &["check"],
        )
        .map_err(|e| DetectError::Metrics(e.to_string()))?;

        registry
            .register(Box::new(anomalies.clone()))
            .map_err(|e| DetectError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(cycles.clone()))
            .map_err(|e| DetectError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(check_failures.clone()))
            .map_err(|e| DetectError::Metrics(e.to_string()))?;

        self.metrics = Some(DetectorMetrics {
            anomalies,
            cycles,
            check_failures,
        });
        Ok(self)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Names of the registered checks, in run order
    pub fn checks(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every check once.
    ///
    /// An unreachable repository skips the whole cycle. Errors from a single
    /// check are logged and counted; the remaining checks still run. Only a
    /// shared-state failure aborts the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, DetectError> {
        let cycle = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let collections = match self.probe().await {
            Ok(collections) => collections,
            Err(e) => {
                warn!(
                    cycle,
                    repository = self.repository.name(),
                    error = %e,
                    "Repository unreachable, skipping detection cycle"
                );
                self.state.set_repository_reachable(false)?;
                report.skipped = true;
                return Ok(report);
            }
        };
        self.state.set_repository_reachable(true)?;

        let mut scope = CycleScope::new(cycle, collections);
        for check in &self.checks {
            let findings = match check.run(self.repository.as_ref(), &mut scope).await {
                Ok(findings) => findings,
                Err(e) => {
                    warn!(cycle, check = check.name(), error = %e, "Check failed, continuing");
                    if let Some(ref m) = self.metrics {
                        m.check_failures.with_label_values(&[check.name()]).inc();
                    }
                    report.failed_checks.push(check.name().to_string());
                    continue;
                }
            };

            debug!(cycle, check = check.name(), findings = findings.len(), "Check complete");
            report.findings += findings.len();
            for anomaly in findings {
                let kind = anomaly.kind();
                match self.state.record_detected(anomaly)? {
                    Admission::Accepted => {
                        report.accepted += 1;
                        if let Some(ref m) = self.metrics {
                            let label = kind.to_string();
                            m.anomalies.with_label_values(&[label.as_str()]).inc();
                        }
                    }
                    Admission::Suppressed => report.suppressed += 1,
                    Admission::Overflow => report.overflowed += 1,
                }
            }
        }

        let completed = self.state.record_cycle_complete()?;
        if let Some(ref m) = self.metrics {
            m.cycles.inc();
        }
        info!(
            cycle,
            completed,
            findings = report.findings,
            accepted = report.accepted,
            suppressed = report.suppressed,
            overflowed = report.overflowed,
            failed_checks = report.failed_checks.len(),
            "Detection cycle complete"
        );
        Ok(report)
    }

    async fn probe(&self) -> Result<Vec<String>, StoreError> {
        self.repository.ping().await?;
        self.repository.list_collections().await
    }

    /// Run cycles until `shutdown` turns true.
    ///
    /// The signal is checked at the top of every iteration and wakes the
    /// inter-cycle sleep early; a cycle in progress always runs to the end.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            checks = ?self.checks(),
            "Detector loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Detection cycle aborted");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Detector loop stopped");
    }
}
