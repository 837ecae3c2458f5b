use std::time::Duration;

/// Capped exponential backoff: `min(max, initial * 2^attempts)`.
///
/// Saturates at `max` instead of overflowing for large attempt counts.
pub fn exponential(
    initial: Duration,
    max: Duration,
    attempts: u32,
) -> Duration {
    2_u32
        .checked_pow(attempts)
        .and_then(|factor| initial.checked_mul(factor))
        .map_or(max, |backoff| backoff.min(max))
}

/// Converts a std duration into a chrono one, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Tracks consecutive failures of a polling loop and stretches its wait.
#[derive(Debug, Clone)]
pub(crate) struct PollControl {
    failed_attempts: u32,
    duration: Duration,
    duration_max: Duration,
}

impl PollControl {
    pub fn new(
        duration: Duration,
        duration_max: Duration,
    ) -> Self {
        Self {
            failed_attempts: 0,
            duration,
            duration_max: duration_max.max(duration),
        }
    }

    pub fn increment_failed_attempts(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    pub fn reset_failed_attempts(&mut self) {
        self.failed_attempts = 0;
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Extra wait on top of the regular tick, zero when the last poll worked.
    pub fn backoff(&self) -> Duration {
        if self.failed_attempts == 0 {
            return Duration::ZERO;
        }
        exponential(self.duration, self.duration_max, self.failed_attempts)
    }
}
