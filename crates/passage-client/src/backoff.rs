//! Reconnect backoff computation

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`
/// capped at `cap`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 2u32.saturating_pow(exponent);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_until_cap() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30000);

        let delays: Vec<u64> = (1..=6)
            .map(|attempt| reconnect_delay(attempt, base, cap).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn test_backoff_stays_capped() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30000);

        assert_eq!(reconnect_delay(10, base, cap), cap);
        assert_eq!(reconnect_delay(100, base, cap), cap);
    }

    #[test]
    fn test_first_attempt_uses_base() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(reconnect_delay(1, base, cap), base);
    }
}
