//! Exponential backoff with jitter, shared by the pop retry loop and the
//! semaphore's blocking acquire.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped at `cap`, then jittered down to somewhere in the upper half so
/// contending workers spread out instead of thundering in lockstep.
pub fn delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let millis = capped.as_millis() as u64;
    if millis <= 1 {
        return capped;
    }
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_until_cap() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_secs(1);
        for attempt in 0..32 {
            let d = delay(attempt, base, cap);
            assert!(d <= cap, "attempt {attempt} exceeded cap: {d:?}");
            let full = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
            assert!(d >= full / 2, "attempt {attempt} jittered below half: {d:?}");
        }
    }

    #[test]
    fn delay_is_capped_for_large_attempts() {
        let d = delay(u32::MAX, Duration::from_millis(50), Duration::from_secs(1));
        assert!(d <= Duration::from_secs(1));
    }

    #[test]
    fn tiny_base_does_not_panic() {
        let d = delay(0, Duration::from_millis(0), Duration::from_secs(1));
        assert_eq!(d, Duration::ZERO);
    }
}
