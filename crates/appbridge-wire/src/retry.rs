//! Retry policy for the window-registration startup race.
//!
//! An application may accept the WebSocket before it has registered the
//! window a command targets. Only that remote error is retried, with
//! exponential backoff; everything else propagates on the first failure.

use crate::client::CommandExecutor;
use crate::config::RetrySettings;
use crate::error::BridgeResult;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Bounded exponential-backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The full delay schedule between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|retry| self.delay_for(retry))
    }

    /// Run `command`, retrying only on the registration-race error.
    ///
    /// Each attempt is a fresh request (new correlation id). When attempts run
    /// out, the last error is returned unchanged.
    pub async fn execute<E>(
        &self,
        executor: &E,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value>
    where
        E: CommandExecutor + ?Sized,
    {
        let mut retry = 0;
        loop {
            match executor.execute(command, args.clone(), timeout).await {
                Err(e) if e.is_registration_race() && retry + 1 < self.max_attempts => {
                    let delay = self.delay_for(retry);
                    debug!(
                        command,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Target not registered yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Fails with a scripted error a fixed number of times, then succeeds.
    struct Flaky {
        failures: u32,
        error: BridgeError,
        calls: Mutex<Vec<Instant>>,
    }

    impl Flaky {
        fn new(failures: u32, error: BridgeError) -> Self {
            Self {
                failures,
                error,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandExecutor for Flaky {
        async fn execute(
            &self,
            _command: &str,
            args: Value,
            _timeout: Option<Duration>,
        ) -> BridgeResult<Value> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len() as u32
            };
            if n <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(json!({"echo": args, "attempt": n}))
            }
        }
    }

    fn race() -> BridgeError {
        BridgeError::RemoteCommand {
            command: "execute_js".into(),
            message: "Window not found: main".into(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(8),
        }
    }

    #[test]
    fn test_delay_schedule_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(64), policy.max_delay);
    }

    #[test]
    fn test_policy_from_settings() {
        let policy = RetryPolicy::from(&RetrySettings {
            max_attempts: 0,
            initial_delay_ms: 50,
            max_delay_ms: 400,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_succeeds_after_k_races() {
        let executor = Flaky::new(3, race());
        let result = fast_policy(5)
            .execute(&executor, "execute_js", json!({"script": "1"}), None)
            .await
            .unwrap();
        assert_eq!(result["attempt"], 4);
        assert_eq!(executor.call_count(), 4);

        let calls = executor.calls.lock().unwrap().clone();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(2));
        assert!(gaps[2] >= Duration::from_millis(8));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let executor = Flaky::new(10, race());
        let err = fast_policy(3)
            .execute(&executor, "execute_js", Value::Null, None)
            .await
            .unwrap_err();
        assert!(err.is_registration_race());
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let executor = Flaky::new(
            1,
            BridgeError::RemoteCommand {
                command: "execute_js".into(),
                message: "ReferenceError: foo is not defined".into(),
            },
        );
        let err = fast_policy(5)
            .execute(&executor, "execute_js", Value::Null, None)
            .await
            .unwrap_err();
        assert!(!err.is_registration_race());
        assert_eq!(executor.call_count(), 1);

        let executor = Flaky::new(1, BridgeError::Connection("gone".into()));
        let err = fast_policy(5)
            .execute(&executor, "list_windows", Value::Null, None)
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(executor.call_count(), 1);
    }
}
