// SPDX-License-Identifier: PMPL-1.0-or-later
//! Lifecycle of the detector and fixer loops.
//!
//! Both loops run as independent tokio tasks that share nothing but the
//! [`SharedState`]. Shutdown flips a `watch` channel; each loop notices it at
//! its next sleep or loop top, finishes any repository call in progress, and
//! returns. `shutdown` awaits both tasks.

use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mendb_detect::Detector;
use mendb_fixer::Fixer;
use mendb_state::{SharedState, StateSnapshot, SystemStatus};
use mendb_store::Repository;

use crate::config::MendConfig;
use crate::{ApiError, AppState};

/// Owns the detector and fixer and their tasks
pub struct Orchestrator {
    state: Arc<SharedState>,
    detector: Arc<Detector>,
    fixer: Arc<Fixer>,
    app_state: AppState,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Wire state, detector, fixer and metrics for `repository`.
    pub fn new(repository: Arc<dyn Repository>, config: &MendConfig) -> Result<Self, ApiError> {
        let registry = Registry::new();
        let state = Arc::new(SharedState::new(config.state.clone())?);

        let detector = Detector::new(
            Arc::clone(&repository),
            Arc::clone(&state),
            config.detector.clone(),
        )
        .with_prometheus(&registry)?;
        let fixer = Fixer::new(repository, Arc::clone(&state), config.fixer.clone())
            .with_prometheus(&registry)?;
        let app_state = AppState::new(Arc::clone(&state), registry)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state,
            detector: Arc::new(detector),
            fixer: Arc::new(fixer),
            app_state,
            shutdown,
            tasks: Vec::new(),
        })
    }

    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// State for the status router
    pub fn app_state(&self) -> AppState {
        self.app_state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the detector and fixer loops.
    pub fn start(&mut self) -> Result<(), ApiError> {
        if self.is_running() {
            return Err(ApiError::Internal("orchestrator already started".to_string()));
        }
        let detector_config = self.detector.config();
        let fixer_config = self.fixer.config();
        info!(
            checks = ?self.detector.checks(),
            strategies = ?self.fixer.strategies(),
            queue_capacity = self.state.queue_capacity(),
            detection_interval_secs = detector_config.interval.as_secs(),
            fix_pacing_ms = fixer_config.pacing.as_millis() as u64,
            auto_fix = fixer_config.auto_fix,
            dry_run = fixer_config.dry_run,
            backup_before_fix = fixer_config.backup_before_fix,
            "Starting self-healing loops"
        );

        let detector = Arc::clone(&self.detector);
        let rx = self.shutdown.subscribe();
        self.tasks
            .push(tokio::spawn(async move { detector.run(rx).await }));

        let fixer = Arc::clone(&self.fixer);
        let rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move { fixer.run(rx).await }));
        Ok(())
    }

    /// Signal both loops, wait for them, and return the final snapshot.
    pub async fn shutdown(mut self) -> Result<StateSnapshot, ApiError> {
        info!("Shutting down self-healing loops");
        // No receivers just means the loops were never started
        let _ = self.shutdown.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Loop task ended abnormally");
            }
        }
        self.state.set_status(SystemStatus::Stopped)?;

        let snapshot = self.state.snapshot()?;
        info!(
            detected = snapshot.statistics.detected,
            fixed = snapshot.statistics.fixed,
            failed = snapshot.statistics.failed,
            cycles = snapshot.statistics.detection_cycles_run,
            overflow_drops = snapshot.statistics.overflow_drops,
            "Self-healing loops stopped"
        );
        Ok(snapshot)
    }
}
