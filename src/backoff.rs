//! Exponential backoff cursor used by each synchronizer task (§4.D Retry
//! policy). State is per-task: every [`Backoff`] instance tracks its own
//! cursor so one task's failures never throttle another.

use std::time::Duration;

pub const BASE: Duration = Duration::from_secs(1);
pub const FACTOR: u32 = 2;
pub const MAX: Duration = Duration::from_secs(60);

pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff { current: BASE }
    }
}

impl Backoff {
    /// The delay to wait before the next retry, then advances the cursor by
    /// `FACTOR`, clamped at `MAX`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * FACTOR).min(MAX);
        delay
    }

    /// Resets the cursor to `BASE` after a successful attempt.
    pub fn reset(&mut self) {
        self.current = BASE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_max_then_resets() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn clamps_at_max() {
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX);
    }
}
