use std::time::Duration;

/// Bounded exponential backoff used by the dispatcher for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-indexed).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt`.
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_secs_f64();
        let cap = self.max_backoff.as_secs_f64();

        let mut delay = initial;
        for _ in 1..attempt {
            delay *= self.multiplier;
            // cap while iterating so large attempt counts can't overflow to infinity
            if delay >= cap {
                delay = cap;
                break;
            }
        }
        if !delay.is_finite() || delay < 0.0 {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay.min(cap))
    }
}
