use std::collections::VecDeque;
use std::time::Duration;

use signal_proto::IceCandidate;
use tokio::time::Instant;

/// Retry schedule for remote candidates that arrive before a remote
/// description has been applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Multiplier applied to the interval after every failed attempt.
    pub backoff: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff: 1.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(1.0).powi(exponent);
        let millis = self.interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCandidate {
    pub candidate: IceCandidate,
    pub attempts: u32,
    pub due: Instant,
}

/// Returned when a candidate has used up its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted {
    pub candidate: IceCandidate,
    pub attempts: u32,
}

/// Candidates parked until the remote description lands. Each candidate leaves
/// the queue exactly once: drained for application, or exhausted.
#[derive(Debug)]
pub struct CandidateQueue {
    policy: RetryPolicy,
    pending: VecDeque<PendingCandidate>,
}

impl CandidateQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: VecDeque::new(),
        }
    }

    /// Park a candidate whose first application attempt could not happen.
    pub fn defer(&mut self, candidate: IceCandidate, now: Instant) -> Result<(), Exhausted> {
        self.schedule(candidate, 1, now)
    }

    /// Put back a candidate taken by [`take_due`](Self::take_due) that still
    /// cannot be applied.
    pub fn requeue(&mut self, pending: PendingCandidate, now: Instant) -> Result<(), Exhausted> {
        self.schedule(pending.candidate, pending.attempts + 1, now)
    }

    fn schedule(
        &mut self,
        candidate: IceCandidate,
        attempts: u32,
        now: Instant,
    ) -> Result<(), Exhausted> {
        if attempts >= self.policy.max_attempts {
            return Err(Exhausted {
                candidate,
                attempts,
            });
        }
        let due = now + self.policy.delay_after(attempts);
        self.pending.push_back(PendingCandidate {
            candidate,
            attempts,
            due,
        });
        Ok(())
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<PendingCandidate> {
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if pending.due <= now {
                due.push(pending);
            } else {
                waiting.push_back(pending);
            }
        }
        self.pending = waiting;
        due
    }

    /// Everything still parked, in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending
            .drain(..)
            .map(|pending| pending.candidate)
            .collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|pending| pending.due).min()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
