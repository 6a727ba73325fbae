#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// A connection that stays up this long resets the backoff attempt counter.
pub const RECONNECT_RESET_AFTER: Duration = Duration::from_secs(60 * 5);

/// Exponential backoff with jitter for transport reconnects.
///
/// Returns the instant of the next attempt and the chosen delay in
/// milliseconds. Each reconnect re-runs the full handshake; nothing carries
/// over at the application layer.
pub fn schedule_reconnect(attempt: u32) -> (Instant, u64) {
	let base_ms = 500u64;
	let max_ms = 30_000u64;
	let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
	let delay_ms = (base_ms.saturating_mul(pow)).min(max_ms);
	let jitter_window = (delay_ms / 10).max(1);
	let mut rng = rand::rng();
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));
	let final_ms = delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset);
	(Instant::now() + Duration::from_millis(final_ms), final_ms)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn delay_grows_and_caps() {
		let (_, first) = schedule_reconnect(1);
		assert!(first <= 600);

		let (_, tenth) = schedule_reconnect(10);
		// Capped at 30s plus jitter.
		assert!(tenth <= 33_000);
		assert!(tenth >= 27_000);
	}

	#[tokio::test]
	async fn jitter_stays_near_the_base_delay() {
		for attempt in 1..=6 {
			let (_, delay) = schedule_reconnect(attempt);
			let expected = 500u64 * 2u64.pow(attempt - 1);
			let window = (expected / 10).max(1);
			assert!(delay >= expected - window);
			assert!(delay <= expected + window);
		}
	}
}
