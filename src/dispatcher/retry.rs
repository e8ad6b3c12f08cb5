//! Jittered exponential backoff for dispatcher send retries.
//!
//! No backoff crate is pulled in: the teacher's own retry glue
//! (`PendingDispatchWorker`) rolls a fixed-interval sleep by hand, so
//! this follows the same posture for the slightly richer full-jitter
//! schedule spec.md §4.5 asks for.

use std::time::Duration;

use rand::Rng;

const BASE_MS: u64 = 250;
const MAX_MS: u64 = 30_000;

/// `delay = uniform(0, min(MAX_MS, BASE_MS * 2^attempt))` — full jitter,
/// capped so a long retry run never sleeps absurdly long between tries.
/// `attempt` is 1-based (the first retry after an initial failure).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let cap = exp.min(MAX_MS);
    let jittered = rand::thread_rng().gen_range(0..=cap.max(1));
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d.as_millis() as u64 <= MAX_MS);
        }
    }

    #[test]
    fn delay_grows_with_attempt_on_average() {
        let low: u64 = (0..200).map(|_| backoff_delay(1).as_millis() as u64).sum();
        let high: u64 = (0..200).map(|_| backoff_delay(5).as_millis() as u64).sum();
        assert!(high > low);
    }
}
