use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// `base * 2^attempt + uniform(0, base)`, shared by the Tool Executor's
/// retry loop and the Agent Runner's provider-error retry loop. `attempt`
/// is zero-based: the wait before the first retry (attempt 0) is
/// `base..2*base`, doubling each attempt after that.
pub fn next_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exp = 2u32.saturating_pow(attempt.min(20));
    let scaled = base.saturating_mul(exp).min(max);
    let jitter_upper_ms = base.as_millis().min(u128::from(u32::MAX)) as u64;
    let jitter_ms = if jitter_upper_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_upper_ms)
    };
    (scaled + Duration::from_millis(jitter_ms)).min(max)
}

/// Outcome of waiting out a backoff delay: either the delay elapsed, or
/// the run was cancelled partway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Sleeps for `delay`, but wakes immediately if `token` is cancelled first,
/// so a retry loop never blocks shutdown.
pub async fn wait_cancellable(delay: Duration, token: &CancellationToken) -> WaitOutcome {
    tokio::select! {
        _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
        _ = token.cancelled() => WaitOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_grows_with_attempt_and_respects_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let d0 = next_delay(base, 0, max);
        let d3 = next_delay(base, 3, max);
        assert!(d0 >= base);
        assert!(d3 >= d0, "later attempts should not produce a smaller floor");
        assert!(next_delay(base, 10, max) <= max);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_cancellable_elapses_when_not_cancelled() {
        let token = CancellationToken::new();
        let outcome = wait_cancellable(Duration::from_millis(50), &token).await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_cancellable_short_circuits_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = wait_cancellable(Duration::from_secs(60), &token).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
