// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared operational state.
//!
//! One synchronized aggregate owns the anomaly queue, the counters, the two
//! recent-anomaly ring buffers and the in-flight pointer. The detector and the
//! fixer mutate it through a handful of methods; the status API reads it via
//! [`SharedState::snapshot`]. Every method takes the single mutex for the
//! duration of an in-memory update only. Nothing here touches the repository,
//! so a slow datastore can never stall a reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::anomaly::{Anomaly, Fingerprint};
use crate::queue::{AnomalyQueue, DEFAULT_QUEUE_CAPACITY};
use crate::StateError;

/// Default length of the recent-detected and recent-fixed ring buffers.
pub const DEFAULT_RECENT_CAPACITY: usize = 50;

/// Configuration for the shared state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Hard bound on queued anomalies
    pub queue_capacity: usize,
    /// Length of each recent-anomaly ring buffer
    pub recent_capacity: usize,
    /// Skip findings whose fingerprint is already queued or in flight
    pub suppress_pending_duplicates: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            suppress_pending_duplicates: true,
        }
    }
}

/// Monotonic counters and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub detected: u64,
    pub fixed: u64,
    pub failed: u64,
    pub detection_cycles_run: u64,
    /// Findings rejected by a full queue
    pub overflow_drops: u64,
    pub started_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_fix: Option<DateTime<Utc>>,
}

/// What the fixer is doing right now
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FixerStatus {
    Idle,
    Fixing,
}

/// Overall lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Initializing,
    Running,
    Disconnected,
    Stopped,
}

/// Health block of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub status: SystemStatus,
    pub repository_reachable: bool,
    pub queue_depth: usize,
    pub fixer_status: FixerStatus,
}

/// Immutable, consistent copy of the whole state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub statistics: Statistics,
    pub health: Health,
    /// Newest first
    pub recent_detected: Vec<Anomaly>,
    /// Newest first
    pub recent_fixed: Vec<Anomaly>,
    pub in_flight: Option<Anomaly>,
    pub queue_capacity: usize,
    pub recent_capacity: usize,
}

/// Result of offering a finding to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for remediation
    Accepted,
    /// Same finding already queued or in flight
    Suppressed,
    /// Queue full; finding dropped
    Overflow,
}

#[derive(Debug)]
struct Inner {
    statistics: Statistics,
    status: SystemStatus,
    repository_reachable: bool,
    fixer_status: FixerStatus,
    recent_detected: VecDeque<Anomaly>,
    recent_fixed: VecDeque<Anomaly>,
    in_flight: Option<Anomaly>,
    /// Fingerprints of queued and in-flight anomalies
    pending: HashSet<Fingerprint>,
}

/// Thread-safe operational state shared by detector, fixer and readers.
///
/// Obtain it once, wrap it in an `Arc`, and pass it explicitly to every
/// component that needs it.
#[derive(Debug)]
pub struct SharedState {
    config: StateConfig,
    queue: AnomalyQueue,
    inner: Mutex<Inner>,
}

impl SharedState {
    /// Create the state with an empty queue.
    pub fn new(config: StateConfig) -> Result<Self, StateError> {
        if config.recent_capacity == 0 {
            return Err(StateError::InvalidCapacity(
                "recent capacity must be at least 1".to_string(),
            ));
        }
        let queue = AnomalyQueue::new(config.queue_capacity)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                statistics: Statistics {
                    detected: 0,
                    fixed: 0,
                    failed: 0,
                    detection_cycles_run: 0,
                    overflow_drops: 0,
                    started_at: Utc::now(),
                    last_check: None,
                    last_fix: None,
                },
                status: SystemStatus::Initializing,
                repository_reachable: false,
                fixer_status: FixerStatus::Idle,
                recent_detected: VecDeque::with_capacity(config.recent_capacity),
                recent_fixed: VecDeque::with_capacity(config.recent_capacity),
                in_flight: None,
                pending: HashSet::new(),
            }),
            queue,
            config,
        })
    }

    /// Create with default config
    pub fn with_defaults() -> Result<Self, StateError> {
        Self::new(StateConfig::default())
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StateError> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Offer a freshly detected anomaly.
    ///
    /// Accepted anomalies are queued, mirrored into `recent_detected` and
    /// counted. A full queue drops the finding and bumps `overflow_drops`;
    /// the detector is never blocked.
    pub fn record_detected(&self, anomaly: Anomaly) -> Result<Admission, StateError> {
        let mut inner = self.lock()?;
        let fingerprint = anomaly.fingerprint();

        if self.config.suppress_pending_duplicates && inner.pending.contains(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Finding already pending, not re-queued");
            return Ok(Admission::Suppressed);
        }

        let mirror = anomaly.clone();
        if !self.queue.push(anomaly) {
            inner.statistics.overflow_drops += 1;
            return Ok(Admission::Overflow);
        }

        inner.pending.insert(fingerprint);
        inner.recent_detected.push_front(mirror);
        inner.recent_detected.truncate(self.config.recent_capacity);
        inner.statistics.detected += 1;
        Ok(Admission::Accepted)
    }

    /// Pop the next anomaly and mark it in flight.
    ///
    /// Pop, `in_flight` and `fixer_status` change under one lock, so no reader
    /// sees one without the other. Returns `None` (and leaves the fixer idle)
    /// when the queue is empty.
    pub fn take_for_fix(&self) -> Result<Option<Anomaly>, StateError> {
        let mut inner = self.lock()?;
        if let Some(current) = &inner.in_flight {
            warn!(anomaly = %current.id(), "take_for_fix called while an anomaly is in flight");
            return Ok(None);
        }

        match self.queue.pop()? {
            Some(anomaly) => {
                inner.in_flight = Some(anomaly.clone());
                inner.fixer_status = FixerStatus::Fixing;
                Ok(Some(anomaly))
            }
            None => {
                inner.fixer_status = FixerStatus::Idle;
                Ok(None)
            }
        }
    }

    /// Complete the in-flight anomaly.
    ///
    /// Writes the single fix outcome, clears `in_flight`, returns the fixer to
    /// idle and files the anomaly into `recent_fixed` or the failed counter.
    pub fn record_fix_outcome(&self, mut anomaly: Anomaly, succeeded: bool) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        match &inner.in_flight {
            Some(current) if current.id() == anomaly.id() => {}
            _ => return Err(StateError::NotInFlight(anomaly.id().clone())),
        }
        anomaly.complete(succeeded)?;

        inner.in_flight = None;
        inner.fixer_status = FixerStatus::Idle;
        inner.pending.remove(&anomaly.fingerprint());

        if succeeded {
            let now = Utc::now();
            inner.statistics.fixed += 1;
            inner.statistics.last_fix = Some(now);
            inner.recent_fixed.push_front(anomaly);
            inner.recent_fixed.truncate(self.config.recent_capacity);
        } else {
            inner.statistics.failed += 1;
        }
        Ok(())
    }

    /// Close a detection cycle. Returns the new cycle count.
    pub fn record_cycle_complete(&self) -> Result<u64, StateError> {
        let mut inner = self.lock()?;
        inner.statistics.detection_cycles_run += 1;
        inner.statistics.last_check = Some(Utc::now());
        Ok(inner.statistics.detection_cycles_run)
    }

    /// Record the result of a connectivity probe.
    pub fn set_repository_reachable(&self, reachable: bool) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        if inner.repository_reachable != reachable {
            info!(reachable, "Repository connectivity changed");
        }
        inner.repository_reachable = reachable;
        if inner.status != SystemStatus::Stopped {
            inner.status = if reachable {
                SystemStatus::Running
            } else {
                SystemStatus::Disconnected
            };
        }
        Ok(())
    }

    pub fn set_status(&self, status: SystemStatus) -> Result<(), StateError> {
        self.lock()?.status = status;
        Ok(())
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Full consistent copy for readers.
    pub fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let inner = self.lock()?;
        Ok(StateSnapshot {
            statistics: inner.statistics.clone(),
            health: Health {
                status: inner.status,
                repository_reachable: inner.repository_reachable,
                queue_depth: self.queue.len(),
                fixer_status: inner.fixer_status,
            },
            recent_detected: inner.recent_detected.iter().cloned().collect(),
            recent_fixed: inner.recent_fixed.iter().cloned().collect(),
            in_flight: inner.in_flight.clone(),
            queue_capacity: self.queue.capacity(),
            recent_capacity: self.config.recent_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn state(queue_capacity: usize, recent_capacity: usize) -> SharedState {
        SharedState::new(StateConfig {
            queue_capacity,
            recent_capacity,
            suppress_pending_duplicates: true,
        })
        .unwrap()
    }

    fn missing(n: usize) -> Anomaly {
        Anomaly::missing_field("users", format!("u{}", n).into(), "email")
    }

    #[test]
    fn test_record_detected_mirrors_and_counts() {
        let state = state(10, 50);
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Accepted);
        assert_eq!(state.record_detected(missing(2)).unwrap(), Admission::Accepted);

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.detected, 2);
        assert_eq!(snap.health.queue_depth, 2);
        assert_eq!(snap.recent_detected.len(), 2);
        // Newest first
        assert_eq!(
            snap.recent_detected[0].target().record_id,
            Some("u2".into())
        );
    }

    #[test]
    fn test_overflow_is_counted_not_blocking() {
        let state = state(2, 50);
        state.record_detected(missing(1)).unwrap();
        state.record_detected(missing(2)).unwrap();
        assert_eq!(state.record_detected(missing(3)).unwrap(), Admission::Overflow);

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.detected, 2);
        assert_eq!(snap.statistics.overflow_drops, 1);
        assert_eq!(snap.health.queue_depth, snap.queue_capacity);
    }

    #[test]
    fn test_pending_duplicates_are_suppressed_until_completed() {
        let state = state(10, 50);
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Accepted);
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Suppressed);

        let taken = state.take_for_fix().unwrap().unwrap();
        // Still in flight, still suppressed
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Suppressed);

        state.record_fix_outcome(taken, true).unwrap();
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Accepted);
    }

    #[test]
    fn test_suppression_keys_on_each_part_separately() {
        let state = state(10, 50);
        let a = Anomaly::missing_field("users", "u:1".into(), "name");
        let b = Anomaly::missing_field("users:u", "1".into(), "name");
        assert_eq!(state.record_detected(a).unwrap(), Admission::Accepted);
        assert_eq!(state.record_detected(b).unwrap(), Admission::Accepted);
        assert_eq!(state.queue_depth(), 2);
    }

    #[test]
    fn test_suppression_can_be_disabled() {
        let state = SharedState::new(StateConfig {
            suppress_pending_duplicates: false,
            ..StateConfig::default()
        })
        .unwrap();
        state.record_detected(missing(1)).unwrap();
        assert_eq!(state.record_detected(missing(1)).unwrap(), Admission::Accepted);
        assert_eq!(state.queue_depth(), 2);
    }

    #[test]
    fn test_take_for_fix_sets_in_flight_and_fixing() {
        let state = state(10, 50);
        assert!(state.take_for_fix().unwrap().is_none());
        assert_eq!(state.snapshot().unwrap().health.fixer_status, FixerStatus::Idle);

        state.record_detected(missing(1)).unwrap();
        let taken = state.take_for_fix().unwrap().unwrap();

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.in_flight.as_ref().map(|a| a.id()), Some(taken.id()));
        assert_eq!(snap.health.fixer_status, FixerStatus::Fixing);
        assert_eq!(snap.health.queue_depth, 0);
    }

    #[test]
    fn test_only_one_anomaly_in_flight() {
        let state = state(10, 50);
        state.record_detected(missing(1)).unwrap();
        state.record_detected(missing(2)).unwrap();
        let _first = state.take_for_fix().unwrap().unwrap();
        assert!(state.take_for_fix().unwrap().is_none());
        assert_eq!(state.queue_depth(), 1);
    }

    #[test]
    fn test_success_moves_to_recent_fixed() {
        let state = state(10, 50);
        state.record_detected(missing(1)).unwrap();
        let taken = state.take_for_fix().unwrap().unwrap();
        state.record_fix_outcome(taken, true).unwrap();

        let snap = state.snapshot().unwrap();
        assert!(snap.in_flight.is_none());
        assert_eq!(snap.health.fixer_status, FixerStatus::Idle);
        assert_eq!(snap.statistics.fixed, 1);
        assert_eq!(snap.statistics.failed, 0);
        assert!(snap.statistics.last_fix.is_some());
        assert_eq!(snap.recent_fixed.len(), 1);
        assert_eq!(snap.recent_fixed[0].fix_succeeded(), Some(true));
    }

    #[test]
    fn test_failure_counts_but_is_not_archived() {
        let state = state(10, 50);
        state.record_detected(missing(1)).unwrap();
        let taken = state.take_for_fix().unwrap().unwrap();
        state.record_fix_outcome(taken, false).unwrap();

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.failed, 1);
        assert_eq!(snap.statistics.fixed, 0);
        assert!(snap.recent_fixed.is_empty());
        assert!(snap.in_flight.is_none());
    }

    #[test]
    fn test_outcome_for_unknown_anomaly_is_rejected() {
        let state = state(10, 50);
        let err = state.record_fix_outcome(missing(1), true).unwrap_err();
        assert!(matches!(err, StateError::NotInFlight(_)));
        assert_eq!(state.snapshot().unwrap().statistics.fixed, 0);
    }

    #[test]
    fn test_ring_buffers_are_bounded() {
        let state = state(100, 5);
        for i in 0..20 {
            state.record_detected(missing(i)).unwrap();
        }
        for _ in 0..20 {
            let taken = state.take_for_fix().unwrap().unwrap();
            state.record_fix_outcome(taken, true).unwrap();
        }
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.recent_detected.len(), 5);
        assert_eq!(snap.recent_fixed.len(), 5);
        assert_eq!(snap.statistics.detected, 20);
        assert_eq!(snap.statistics.fixed, 20);
        assert_eq!(
            snap.recent_fixed[0].target().record_id,
            Some("u19".into())
        );
    }

    #[test]
    fn test_cycle_and_connectivity_bookkeeping() {
        let state = state(10, 50);
        assert_eq!(state.snapshot().unwrap().health.status, SystemStatus::Initializing);

        state.set_repository_reachable(true).unwrap();
        assert_eq!(state.record_cycle_complete().unwrap(), 1);
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.health.status, SystemStatus::Running);
        assert!(snap.health.repository_reachable);
        assert!(snap.statistics.last_check.is_some());

        state.set_repository_reachable(false).unwrap();
        assert_eq!(state.snapshot().unwrap().health.status, SystemStatus::Disconnected);

        state.set_status(SystemStatus::Stopped).unwrap();
        state.set_repository_reachable(true).unwrap();
        assert_eq!(state.snapshot().unwrap().health.status, SystemStatus::Stopped);
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = state(10, 50);
        state
            .record_detected(Anomaly::duplicate(
                "users",
                "email",
                json!("a@x.com"),
                vec!["u1".into(), "u2".into()],
            ))
            .unwrap();
        let value = serde_json::to_value(state.snapshot().unwrap()).unwrap();
        assert_eq!(value["statistics"]["detected"], 1);
        assert_eq!(value["health"]["fixer_status"], "idle");
        assert!(value["in_flight"].is_null());
        assert_eq!(value["recent_detected"][0]["kind"], "duplicate_record");
    }

    #[test]
    fn test_invalid_recent_capacity() {
        let err = SharedState::new(StateConfig {
            recent_capacity: 0,
            ..StateConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, StateError::InvalidCapacity(_)));
    }

    #[test]
    fn test_readers_never_see_partial_updates() {
        let state = Arc::new(state(8, 50));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let state = Arc::clone(&state);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    state.record_detected(missing(i)).unwrap();
                    if let Some(taken) = state.take_for_fix().unwrap() {
                        state.record_fix_outcome(taken, i % 3 != 0).unwrap();
                    }
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let state = Arc::clone(&state);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut last_total = 0;
                    while !done.load(Ordering::SeqCst) {
                        let snap = state.snapshot().unwrap();
                        let fixing = snap.health.fixer_status == FixerStatus::Fixing;
                        assert_eq!(snap.in_flight.is_some(), fixing);
                        assert!(snap.health.queue_depth <= snap.queue_capacity);
                        let total = snap.statistics.fixed + snap.statistics.failed;
                        assert!(total >= last_total);
                        assert!(total <= snap.statistics.detected);
                        last_total = total;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let snap = state.snapshot().unwrap();
        assert_eq!(snap.statistics.detected, 2_000);
        assert_eq!(snap.statistics.fixed + snap.statistics.failed, 2_000);
    }
}
