// Poll backoff: same doubling shape as the teacher's `outbox::backoff_delay`,
// with jitter added so a fleet of idle workers polling the same group
// doesn't all wake up in lockstep (spec §4.3's decorrelation requirement —
// the teacher's outbox is single-process and has no such replica fan-out).

use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: u64 = 50;
const CAP_DELAY_MS: u64 = 1_000;
const JITTER_FRACTION: f64 = 0.25;

/// Tracks the current poll interval for a worker finding no due task.
/// Doubles on each consecutive empty poll up to `CAP_DELAY_MS`, resets
/// to the base on any successful assignment.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    attempt: u32,
}

impl PollBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay to sleep before the next poll, jittered by ±`JITTER_FRACTION`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        let base_ms = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(CAP_DELAY_MS);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = (base_ms as f64 * JITTER_FRACTION) as i64;
        let offset = if jitter_span > 0 { rand::thread_rng().gen_range(-jitter_span..=jitter_span) } else { 0 };
        let jittered_ms = (base_ms as i64 + offset).max(0) as u64;
        Duration::from_millis(jittered_ms)
    }

    /// Resets to the base delay after a successful assignment.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let mut backoff = PollBackoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis((CAP_DELAY_MS as f64 * (1.0 + JITTER_FRACTION)) as u64));
            last = delay;
        }
        assert!(last > Duration::ZERO);
    }

    #[test]
    fn reset_returns_to_base_range() {
        let mut backoff = PollBackoff::new();
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        let max_base = Duration::from_millis((BASE_DELAY_MS as f64 * (1.0 + JITTER_FRACTION)) as u64);
        assert!(delay <= max_base);
    }
}
