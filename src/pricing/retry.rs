use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{RetryClass, SourceError};

/// Bounded retry for live source calls.
///
/// Transient failures back off exponentially from `base_delay`; rate-limit
/// responses wait `rate_limit_delay × attempt`. Permanent failures return
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    rate_limit_delay: Duration,
    sleeper: fn(Duration),
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, rate_limit_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            rate_limit_delay,
            sleeper: std::thread::sleep,
        }
    }

    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_sleeper(mut self, sleeper: fn(Duration)) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `attempt` (0-based), or `None` to give up
    pub fn delay_for(&self, error: &SourceError, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.attempts {
            return None;
        }
        match error.retry_class() {
            RetryClass::Never => None,
            RetryClass::WithBackoff => Some(self.base_delay * 2u32.saturating_pow(attempt)),
            RetryClass::RateLimited => Some(self.rate_limit_delay * (attempt + 1)),
        }
    }

    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => match self.delay_for(&err, attempt) {
                    Some(delay) => {
                        warn!(
                            "{} failed (attempt {}/{}): {}; retrying in {:?}",
                            label,
                            attempt + 1,
                            self.attempts,
                            err,
                            delay
                        );
                        (self.sleeper)(delay);
                        attempt += 1;
                    }
                    None => {
                        debug!("{} failed, not retrying: {}", label, err);
                        return Err(err);
                    }
                },
            }
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.attempts,
            settings.base_delay(),
            settings.rate_limit_delay(),
        )
    }
}
