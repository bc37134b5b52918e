use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::HardwareConfig;
use crate::hardware::HardwareError;

/// Bounded exponential backoff for hardware commands.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &HardwareConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.backoff_initial_ms),
            max_delay: Duration::from_millis(cfg.backoff_max_ms.max(cfg.backoff_initial_ms)),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `command` once plus up to `max_retries` retries.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run<T, F, Fut>(&self, command: &str, mut op: F) -> Result<T, HardwareError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HardwareError>>,
    {
        let attempts = self.max_retries + 1;
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(retry);
                    retry += 1;
                    warn!(
                        command,
                        attempt = retry,
                        attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Hardware command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(250));
        assert_eq!(p.delay_for(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("stop_charging", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HardwareError::Communication("busy".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("start_charging", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HardwareError::Rejected("fault".into()))
            })
            .await;
        assert_eq!(result, Err(HardwareError::Rejected("fault".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
