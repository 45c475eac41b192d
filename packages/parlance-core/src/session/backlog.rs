//! Per-provider send backlog governor.
//!
//! Bounds the number of inflight `send_audio` calls per provider. Between
//! the soft and hard limits, chunks are dropped against a time budget; at
//! the hard limit (or budget exhaustion) the provider is failed so a stuck
//! adapter never stalls the rest of the fan-out.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::protocol_constants::MEETING_QUEUE_FACTOR;
use crate::state::BacklogConfig;

/// Decision for one incoming chunk.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Enqueue the send; caller must pair with [`BacklogGovernor::complete`].
    Send,
    /// Drop the chunk silently (budget not yet exhausted).
    Drop,
    /// Fail the provider.
    Fail(TransportError),
}

/// Pending-send counter with soft-threshold drop and hard-threshold failure.
#[derive(Debug)]
pub struct BacklogGovernor {
    pending: AtomicUsize,
    dropped_ms: Mutex<f64>,
    soft_limit: usize,
    hard_limit: usize,
    max_drop_ms: f64,
}

impl BacklogGovernor {
    /// Creates a governor. Meeting mode raises the hard ceiling so deep
    /// queues survive; the drop budget still engages at the soft limit.
    pub fn new(config: BacklogConfig, meeting_mode: bool) -> Self {
        let hard_limit = if meeting_mode {
            config.hard_limit * MEETING_QUEUE_FACTOR
        } else {
            config.hard_limit
        };
        Self {
            pending: AtomicUsize::new(0),
            dropped_ms: Mutex::new(0.0),
            soft_limit: config.soft_limit,
            hard_limit,
            max_drop_ms: config.max_drop_ms,
        }
    }

    /// Applies the admission policy to a chunk of `duration_ms`.
    pub fn admit(&self, duration_ms: f64) -> Admission {
        let pending = self.pending.load(Ordering::SeqCst);
        if pending >= self.hard_limit {
            return Admission::Fail(TransportError::BacklogHardLimit);
        }
        if pending >= self.soft_limit {
            let mut dropped = self.dropped_ms.lock();
            *dropped += duration_ms;
            if *dropped > self.max_drop_ms {
                return Admission::Fail(TransportError::DropBudgetExceeded);
            }
            return Admission::Drop;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        Admission::Send
    }

    /// Marks one admitted send as completed.
    ///
    /// Once the queue falls back under the soft limit the drop budget
    /// resets; dropping is forgiven as soon as the provider catches up.
    pub fn complete(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "complete() without matching admit()");
        if prev.saturating_sub(1) < self.soft_limit {
            *self.dropped_ms.lock() = 0.0;
        }
    }

    /// Current inflight send count.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Milliseconds of audio dropped since the last catch-up.
    pub fn dropped_ms(&self) -> f64 {
        *self.dropped_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(soft: usize, hard: usize, max_drop: f64) -> BacklogGovernor {
        BacklogGovernor::new(
            BacklogConfig {
                soft_limit: soft,
                hard_limit: hard,
                max_drop_ms: max_drop,
            },
            false,
        )
    }

    #[test]
    fn sends_below_soft_limit() {
        let g = governor(2, 8, 1000.0);
        assert_eq!(g.admit(100.0), Admission::Send);
        assert_eq!(g.admit(100.0), Admission::Send);
        assert_eq!(g.pending(), 2);
    }

    #[test]
    fn drops_between_soft_and_hard() {
        let g = governor(1, 8, 1000.0);
        assert_eq!(g.admit(100.0), Admission::Send);
        assert_eq!(g.admit(100.0), Admission::Drop);
        assert_eq!(g.pending(), 1);
        assert_eq!(g.dropped_ms(), 100.0);
    }

    #[test]
    fn drop_budget_exhaustion_fails_provider() {
        // Scenario from the streaming handlers: soft=1, hard=10, budget=500,
        // frames of 250ms against an adapter that never completes a send.
        let g = governor(1, 10, 500.0);
        assert_eq!(g.admit(250.0), Admission::Send);
        assert_eq!(g.admit(250.0), Admission::Drop); // 250ms dropped
        assert_eq!(g.admit(250.0), Admission::Drop); // 500ms dropped, budget not exceeded
        assert_eq!(
            g.admit(250.0),
            Admission::Fail(TransportError::DropBudgetExceeded)
        );
    }

    #[test]
    fn hard_limit_fails_immediately() {
        let g = governor(1, 2, 10_000.0);
        assert_eq!(g.admit(10.0), Admission::Send);
        // Fill to the hard limit by simulating queued sends.
        g.pending.store(2, Ordering::SeqCst);
        assert_eq!(
            g.admit(10.0),
            Admission::Fail(TransportError::BacklogHardLimit)
        );
    }

    #[test]
    fn completion_below_soft_limit_resets_drop_budget() {
        let g = governor(1, 8, 1000.0);
        assert_eq!(g.admit(100.0), Admission::Send);
        assert_eq!(g.admit(100.0), Admission::Drop);
        assert!(g.dropped_ms() > 0.0);

        g.complete();
        assert_eq!(g.pending(), 0);
        assert_eq!(g.dropped_ms(), 0.0);
        assert_eq!(g.admit(100.0), Admission::Send);
    }

    #[test]
    fn meeting_mode_raises_hard_ceiling_only() {
        let config = BacklogConfig {
            soft_limit: 2,
            hard_limit: 8,
            max_drop_ms: 1000.0,
        };
        let g = BacklogGovernor::new(config, true);
        assert_eq!(g.soft_limit, 2);
        assert_eq!(g.hard_limit, 32);
    }

    #[test]
    fn pending_never_goes_negative() {
        let g = governor(2, 8, 1000.0);
        assert_eq!(g.admit(10.0), Admission::Send);
        g.complete();
        assert_eq!(g.pending(), 0);
    }
}
