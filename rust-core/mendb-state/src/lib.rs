// SPDX-License-Identifier: PMPL-1.0-or-later
//! MendDB State
//!
//! The anomaly model and the shared operational state that the detector, the
//! fixer and the status API coordinate through.
//!
//! ```text
//!   detector ──record_detected──▶ ┌─────────────┐ ◀──snapshot── status API
//!                                 │ SharedState │
//!   fixer ◀──take_for_fix──────── │  queue      │
//!   fixer ───record_fix_outcome─▶ │  counters   │
//!                                 └─────────────┘
//! ```

#![forbid(unsafe_code)]

mod anomaly;
mod queue;
mod state;

use thiserror::Error;

pub use anomaly::{
    Anomaly, AnomalyContext, AnomalyId, AnomalyKind, Fingerprint, FixOutcome, RemediationKind,
    Severity, Target,
};
pub use queue::{AnomalyQueue, DEFAULT_QUEUE_CAPACITY};
pub use state::{
    Admission, FixerStatus, Health, SharedState, StateConfig, StateSnapshot, Statistics,
    SystemStatus, DEFAULT_RECENT_CAPACITY,
};

/// State errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Anomaly {0} already has a fix outcome")]
    AlreadyCompleted(AnomalyId),

    #[error("Anomaly {0} is not the in-flight anomaly")]
    NotInFlight(AnomalyId),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),
}
