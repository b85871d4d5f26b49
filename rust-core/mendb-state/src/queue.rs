// SPDX-License-Identifier: PMPL-1.0-or-later
//! Bounded FIFO of detected anomalies.
//!
//! Backed by a tokio `mpsc` channel used only through its non-blocking pair
//! (`try_send` / `try_recv`), so neither the detector nor the fixer can ever
//! park on the queue. A full queue rejects the newest anomaly.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::warn;

use crate::anomaly::Anomaly;
use crate::StateError;

/// Default capacity, matching the service's historical limit.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Bounded, non-blocking anomaly queue.
#[derive(Debug)]
pub struct AnomalyQueue {
    tx: mpsc::Sender<Anomaly>,
    rx: Mutex<mpsc::Receiver<Anomaly>>,
}

impl AnomalyQueue {
    /// Create a queue holding at most `capacity` anomalies.
    pub fn new(capacity: usize) -> Result<Self, StateError> {
        if capacity == 0 {
            return Err(StateError::InvalidCapacity(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Enqueue without blocking. Returns `false` when the queue is full.
    pub fn push(&self, anomaly: Anomaly) -> bool {
        match self.tx.try_send(anomaly) {
            Ok(()) => true,
            Err(TrySendError::Full(rejected)) => {
                warn!(
                    anomaly = %rejected.id(),
                    kind = %rejected.kind(),
                    capacity = self.capacity(),
                    "Anomaly queue is full, dropping newest anomaly"
                );
                false
            }
            // The receiver lives as long as `self`, so this cannot happen.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Dequeue without blocking. Returns `None` when the queue is empty.
    pub fn pop(&self) -> Result<Option<Anomaly>, StateError> {
        let mut rx = self.rx.lock().map_err(|_| StateError::LockPoisoned)?;
        match rx.try_recv() {
            Ok(anomaly) => Ok(Some(anomaly)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Number of queued anomalies.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The hard capacity bound.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(n: usize) -> Anomaly {
        Anomaly::missing_field("users", format!("u{}", n).into(), "email")
    }

    #[test]
    fn test_fifo_order() {
        let queue = AnomalyQueue::new(4).unwrap();
        let first = sample(1);
        let second = sample(2);
        let (first_id, second_id) = (first.id().clone(), second.id().clone());

        assert!(queue.push(first));
        assert!(queue.push(second));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().unwrap().id(), &first_id);
        assert_eq!(queue.pop().unwrap().unwrap().id(), &second_id);
        assert!(queue.pop().unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let queue = AnomalyQueue::new(2).unwrap();
        assert!(queue.push(sample(1)));
        assert!(queue.push(sample(2)));
        assert!(!queue.push(sample(3)));
        assert_eq!(queue.len(), 2);

        queue.pop().unwrap();
        assert!(queue.push(sample(4)));
        assert_eq!(queue.len(), queue.capacity());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            AnomalyQueue::new(0),
            Err(StateError::InvalidCapacity(_))
        ));
    }

    proptest! {
        #[test]
        fn test_queue_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in proptest::collection::vec(any::<bool>(), 0..64)
        ) {
            let queue = AnomalyQueue::new(capacity).unwrap();
            let mut expected = 0usize;
            for (i, push) in ops.into_iter().enumerate() {
                if push {
                    let accepted = queue.push(sample(i));
                    prop_assert_eq!(accepted, expected < capacity);
                    if accepted {
                        expected += 1;
                    }
                } else {
                    let popped = queue.pop().unwrap();
                    prop_assert_eq!(popped.is_some(), expected > 0);
                    expected = expected.saturating_sub(1);
                }
                prop_assert!(queue.len() <= capacity);
                prop_assert_eq!(queue.len(), expected);
            }
        }
    }
}
