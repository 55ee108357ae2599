use log::debug;
use segprof_api::RemoteError;
use std::time::Duration;

/// Bounded exponential backoff for transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; handy for tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        let capped = delay.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `on_retry` fires before every re-attempt.
    pub fn run<T>(
        &self,
        what: &str,
        mut on_retry: impl FnMut(),
        mut op: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    debug!("{what} failed ({err}), retry {} in {delay:?}", attempt + 1);
                    on_retry();
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(70), Duration::from_millis(500));
    }

    #[test]
    fn transport_errors_retry_until_exhausted() {
        let calls = Cell::new(0);
        let retries = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3).run(
            "execute",
            || retries.set(retries.get() + 1),
            || {
                calls.set(calls.get() + 1);
                Err(RemoteError::Transport("reset".into()))
            },
        );
        assert!(matches!(result, Err(RemoteError::Transport(_))));
        assert_eq!(calls.get(), 3);
        assert_eq!(retries.get(), 2);
    }

    #[test]
    fn recovers_after_transient_failure() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3).run("compile", || {}, || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(RemoteError::Transport("503".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5).run("execute", || {}, || {
            calls.set(calls.get() + 1);
            Err(RemoteError::Load("out of device memory".into()))
        });
        assert!(matches!(result, Err(RemoteError::Load(_))));
        assert_eq!(calls.get(), 1);
    }
}
