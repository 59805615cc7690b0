use std::time::Duration;

/// Deadline for a round before a round change is requested.
///
/// Round 0 waits `request_timeout`; later rounds add `backoff * 2^round`, with the
/// exponent capped at `max_exponent`.
pub fn round_timeout(request_timeout: Duration, backoff: Duration, round: u64, max_exponent: u32) -> Duration {
    if round == 0 {
        return request_timeout;
    }
    let exponent = round.min(max_exponent as u64) as u32;
    let factor = 2u32.saturating_pow(exponent);
    request_timeout.saturating_add(backoff.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_timeout_backoff() {
        let base = Duration::from_millis(1000);
        let backoff = Duration::from_millis(100);
        assert_eq!(round_timeout(base, backoff, 0, 10), base);
        assert_eq!(round_timeout(base, backoff, 1, 10), Duration::from_millis(1200));
        assert_eq!(round_timeout(base, backoff, 3, 10), Duration::from_millis(1800));
        assert_eq!(round_timeout(base, backoff, 50, 4), round_timeout(base, backoff, 4, 4));
    }
}
