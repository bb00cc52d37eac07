// ── Reconnect backoff ──
//
// Delay schedule for re-establishing the event stream after a drop. The
// supervisor in `hubwatch-core` drives it; it lives next to the client so
// anything holding a raw `EventStreamClient` can reuse the same schedule.

use std::time::Duration;

const JITTER: f64 = 0.25;

/// Doubling delay schedule, capped, with +-25% spread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Base delay for the first retry.
    pub initial_delay: Duration,
    /// Cap applied before the spread.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self)
    }

    /// Upper bound of anything [`backoff`](Self::backoff) returns.
    pub fn max_backoff(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + JITTER)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        1_u32
            .checked_shl(attempt)
            .map_or(self.max_delay, |factor| self.initial_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

/// `min(initial * 2^attempt, max) * (1 +- 0.25)`.
///
/// The spread is seeded from the attempt number only: it varies between
/// attempts but is identical for every client on the same attempt.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    config
        .base_delay(attempt)
        .mul_f64(1.0 + JITTER * spread(attempt))
}

/// Deterministic value in `[-1, 1]`.
fn spread(attempt: u32) -> f64 {
    let mixed = attempt.wrapping_mul(0x9E37_79B9) >> 16;
    f64::from(mixed) / 32_767.5 - 1.0
}
