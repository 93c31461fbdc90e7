//! Backoff policy: decides the delay before the next attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry backoff for a failed task.
///
/// Serialized with millisecond fields so it reads naturally in config files and
/// task snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },

    /// `base * 2^(attempts - 1)`, optionally capped.
    Exponential { base_ms: u64, max_ms: Option<u64> },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base_ms: duration_ms(base),
            max_ms: None,
        }
    }

    pub fn exponential_capped(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: duration_ms(base),
            max_ms: Some(duration_ms(max)),
        }
    }

    /// Delay before the next attempt.
    ///
    /// `attempts` is the number of attempts already made (1-indexed). Zero is
    /// treated like the first failure.
    ///
    /// base=2s の exponential なら 2s, 4s, 8s, ... と伸びる。
    pub fn next_delay(&self, attempts: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let exponent = attempts.saturating_sub(1).min(63);
                let factor = 1u64 << exponent;
                let delay = base_ms.saturating_mul(factor);
                let delay = match max_ms {
                    Some(cap) => delay.min(cap),
                    None => delay,
                };
                Duration::from_millis(delay)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential_capped(Duration::from_secs(2), Duration::from_secs(300))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(7, 1)]
    fn fixed_delay_is_constant(#[case] attempts: u32, #[case] secs: u64) {
        let policy = BackoffPolicy::fixed(Duration::from_secs(1));
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(5, 32)]
    fn exponential_backoff_doubles(#[case] attempts: u32, #[case] secs: u64) {
        let policy = BackoffPolicy::exponential(Duration::from_secs(2));
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn exponential_backoff_respects_cap() {
        let policy =
            BackoffPolicy::exponential_capped(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(200), Duration::from_secs(10));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(2));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn deserializes_tagged_form() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"kind":"fixed","delay_ms":1500}"#).unwrap();
        assert_eq!(policy, BackoffPolicy::fixed(Duration::from_millis(1500)));
    }
}
