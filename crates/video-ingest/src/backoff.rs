use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

/// Granularity used when sleeping so stop requests are observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Reconnect delay for the given 1-based attempt: `min(base * attempt, cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt).min(cap)
}

/// Sleep for `duration` while `running` stays set. Returns `false` when the
/// flag was cleared before the full duration elapsed.
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_schedule_caps_at_sixty_seconds() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=32)
            .map(|attempt| backoff_delay(base, cap, attempt).as_secs())
            .collect();
        assert_eq!(&delays[..5], &[2, 4, 6, 8, 10]);
        assert_eq!(delays[29], 60);
        assert!(delays[30..].iter().all(|d| *d == 60));
    }

    #[test]
    fn cleared_flag_cuts_sleep_short() {
        let running = AtomicBool::new(false);
        let start = Instant::now();
        assert!(!sleep_while_running(&running, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn schedule_is_non_decreasing(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, k in 1u32..200) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(cap_ms);
            let mut previous = Duration::ZERO;
            for attempt in 1..=k {
                let delay = backoff_delay(base, cap, attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= cap);
                prop_assert_eq!(delay, (base * attempt).min(cap));
                previous = delay;
            }
        }
    }
}
