//! Randomized delays: election timeouts and RPC retry backoff.

use std::time::Duration;

use rand::Rng;

/// Draw an election timeout uniformly from `[min, max]`.
///
/// §5.2: randomized timeouts make it unlikely that two nodes time out together,
/// so split votes resolve quickly. Re-rolled on every reset.
pub fn election_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// How much randomness is applied to a retry delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JitterMode {
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay / 2, delay]`.
    Partial,
    /// Exactly `delay`.
    None,
}

/// Exponential backoff: `base * 2^attempt`, jittered, then clamped to `[min, max]`.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
    pub jitter: JitterMode,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(20),
            min: Duration::from_millis(10),
            max: Duration::from_millis(200),
            jitter: JitterMode::Full,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor).min(self.max);

        let raw_ms = raw.as_millis() as u64;
        let jittered_ms = match self.jitter {
            JitterMode::None => raw_ms,
            JitterMode::Full => rand::rng().random_range(0..=raw_ms),
            JitterMode::Partial => rand::rng().random_range(raw_ms / 2..=raw_ms),
        };

        Duration::from_millis(jittered_ms).clamp(self.min, self.max.max(self.min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timeout_stays_in_range() {
        let min = Duration::from_millis(150);
        let max = Duration::from_millis(300);
        for _ in 0..200 {
            let t = election_timeout(min, max);
            assert!(t >= min && t <= max, "{t:?} out of range");
        }
    }

    #[test]
    fn election_timeout_degenerate_range() {
        let d = Duration::from_millis(10);
        assert_eq!(election_timeout(d, d), d);
    }

    #[test]
    fn no_jitter_doubles_until_clamped() {
        let backoff = Backoff {
            base: Duration::from_millis(10),
            min: Duration::from_millis(5),
            max: Duration::from_millis(50),
            jitter: JitterMode::None,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
        assert_eq!(backoff.delay(3), Duration::from_millis(50));
        assert_eq!(backoff.delay(40), Duration::from_millis(50));
    }

    #[test]
    fn jittered_delays_respect_window() {
        for jitter in [JitterMode::Full, JitterMode::Partial] {
            let backoff = Backoff {
                jitter,
                ..Backoff::default()
            };
            for attempt in 0..8 {
                let d = backoff.delay(attempt);
                assert!(d >= backoff.min && d <= backoff.max, "{jitter:?} {d:?}");
            }
        }
    }

    #[test]
    fn partial_jitter_keeps_at_least_half() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            min: Duration::ZERO,
            max: Duration::from_secs(1),
            jitter: JitterMode::Partial,
        };
        for _ in 0..100 {
            assert!(backoff.delay(0) >= Duration::from_millis(50));
        }
    }
}
