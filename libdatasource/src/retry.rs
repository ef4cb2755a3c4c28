use std::future::Future;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::time::sleep;

use crate::error::{DatasourceError, Result};

const RACE_RETRIES: usize = 10;

/// Bounded exponential backoff for optimistic read-version / conditional-write loops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RACE_RETRIES,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (0-based), with up to 50% jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it stops reporting [`DatasourceError::Conflict`] or the
/// policy runs out of attempts. Other errors are returned right away.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        match op().await {
            Err(DatasourceError::Conflict) if attempt + 1 < attempts => {
                let delay = policy.backoff(attempt);
                debug!("{label}: conflict on attempt {}, retrying in {delay:?}", attempt + 1);
                sleep(delay).await;
            }
            other => return other,
        }
    }
    Err(DatasourceError::Conflict)
}
