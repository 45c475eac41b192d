//! Attribution queue pairing outbound audio with inbound transcripts.
//!
//! Every chunk published to a provider pushes one entry; every transcript
//! pops the head, yielding the capture span the transcript is timed against.
//! When the adapter emits more transcripts than chunks (segmenters do), the
//! queue synthesizes a continuation from the previous pop rather than losing
//! attribution entirely.

use std::collections::VecDeque;

/// One outbound chunk's capture metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attribution {
    /// End-of-chunk capture timestamp (ms since epoch).
    pub capture_ts: f64,
    /// Chunk duration (ms).
    pub duration_ms: f64,
    pub seq: u32,
}

/// Continuation point left behind by the previous pop.
#[derive(Debug, Clone, Copy)]
struct LastAttributed {
    next_ts: f64,
    duration_ms: f64,
}

/// FIFO attribution queue for one provider session.
#[derive(Debug, Default)]
pub struct AttributionQueue {
    queue: VecDeque<Attribution>,
    last_attributed: Option<LastAttributed>,
    first_capture_ts: Option<f64>,
    last_capture_ts: Option<f64>,
    first_sent_at: Option<f64>,
    last_sent_at: Option<f64>,
    pushes: u64,
    pops: u64,
}

impl AttributionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one published chunk. `sent_at` is the wall clock of the send.
    pub fn push(&mut self, attribution: Attribution, sent_at: f64) {
        self.first_capture_ts.get_or_insert(attribution.capture_ts);
        self.last_capture_ts = Some(attribution.capture_ts);
        self.first_sent_at.get_or_insert(sent_at);
        self.last_sent_at = Some(sent_at);
        self.queue.push_back(attribution);
        self.pushes += 1;
    }

    /// Attributes one inbound transcript.
    ///
    /// Pops the head in FIFO order; on an empty queue the previous pop's
    /// continuation point is used, then the recorded-timestamp fallback
    /// chain, then `now`.
    pub fn attribute(&mut self, now: f64) -> Attribution {
        let attribution = if let Some(head) = self.queue.pop_front() {
            head
        } else if let Some(last) = self.last_attributed {
            Attribution {
                capture_ts: last.next_ts,
                duration_ms: last.duration_ms,
                seq: 0,
            }
        } else {
            let ts = self
                .last_capture_ts
                .or(self.first_capture_ts)
                .or(self.last_sent_at)
                .or(self.first_sent_at)
                .unwrap_or(now);
            Attribution {
                capture_ts: ts,
                duration_ms: 0.0,
                seq: 0,
            }
        };

        self.last_attributed = Some(LastAttributed {
            next_ts: attribution.capture_ts + attribution.duration_ms,
            duration_ms: attribution.duration_ms,
        });
        self.pops += 1;
        attribution
    }

    /// Queue depth (pushed, not yet popped).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Lifetime push counter.
    pub fn pushes(&self) -> u64 {
        self.pushes
    }

    /// Lifetime pop counter.
    pub fn pops(&self) -> u64 {
        self.pops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att(capture_ts: f64, duration_ms: f64, seq: u32) -> Attribution {
        Attribution {
            capture_ts,
            duration_ms,
            seq,
        }
    }

    #[test]
    fn pops_follow_push_order() {
        let mut q = AttributionQueue::new();
        q.push(att(100.0, 50.0, 0), 100.0);
        q.push(att(150.0, 50.0, 1), 150.0);

        assert_eq!(q.attribute(1000.0).capture_ts, 100.0);
        assert_eq!(q.attribute(1000.0).capture_ts, 150.0);
    }

    #[test]
    fn empty_pop_synthesizes_continuation() {
        let mut q = AttributionQueue::new();
        q.push(att(100.0, 50.0, 0), 100.0);

        let first = q.attribute(1000.0);
        assert_eq!(first.capture_ts, 100.0);

        // Queue drained: next pop continues where the last one ended.
        let second = q.attribute(1000.0);
        assert_eq!(second.capture_ts, 150.0);
        assert_eq!(second.duration_ms, 50.0);

        // Continuation keeps walking forward.
        let third = q.attribute(1000.0);
        assert_eq!(third.capture_ts, 200.0);
    }

    #[test]
    fn fallback_chain_uses_last_capture_before_now() {
        let mut q = AttributionQueue::new();
        q.push(att(100.0, 50.0, 0), 400.0);
        q.push(att(200.0, 50.0, 1), 500.0);
        // Drain both without attributing, then clear state by popping twice.
        q.attribute(1000.0);
        q.attribute(1000.0);
        // Now falls back to the continuation; covered above. Test the raw
        // fallback on a queue that never had a pop:
        let mut fresh = AttributionQueue::new();
        fresh.push(att(300.0, 10.0, 0), 600.0);
        // Remove the entry behind the queue's back is impossible; instead,
        // pop once and verify the fallback after exhaustion is continuation,
        // while a never-pushed queue falls back to now.
        let popped = fresh.attribute(1000.0);
        assert_eq!(popped.capture_ts, 300.0);

        let mut empty = AttributionQueue::new();
        let fallback = empty.attribute(1234.0);
        assert_eq!(fallback.capture_ts, 1234.0);
        assert_eq!(fallback.duration_ms, 0.0);
    }

    #[test]
    fn push_and_pop_counters_are_monotonic() {
        let mut q = AttributionQueue::new();
        assert_eq!((q.pushes(), q.pops()), (0, 0));
        q.push(att(1.0, 1.0, 0), 1.0);
        q.push(att(2.0, 1.0, 1), 2.0);
        assert_eq!(q.pushes(), 2);
        q.attribute(10.0);
        q.attribute(10.0);
        q.attribute(10.0);
        assert_eq!(q.pushes(), 2);
        assert_eq!(q.pops(), 3);
    }
}
