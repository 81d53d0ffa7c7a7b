/// Waiting on eventually-consistent cloud state
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long and how often to probe a condition
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    pub fn new(timeout_secs: u64, interval_secs: u64, description: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            interval: Duration::from_secs(interval_secs),
            description: description.into(),
        }
    }

    /// Probe until it yields a value
    ///
    /// `Ok(Some(v))` finishes with `v`, `Ok(None)` keeps waiting, `Err` aborts.
    pub async fn poll<F, Fut, T>(&self, probe: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        info!("{}...", self.description);

        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(value) = probe().await? {
                info!(
                    "✓ {} ({}s)",
                    self.description,
                    start.elapsed().as_secs()
                );
                return Ok(value);
            }

            if start.elapsed() >= self.timeout {
                anyhow::bail!(
                    "Timed out after {}s ({} attempts): {}",
                    self.timeout.as_secs(),
                    attempt,
                    self.description
                );
            }

            debug!(
                "{}: attempt {} not done, retrying in {}s",
                self.description,
                attempt,
                self.interval.as_secs()
            );
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Probe a boolean condition until it holds
    pub async fn poll_until<F, Fut>(&self, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(|| async { Ok(condition().await?.then_some(())) })
            .await
    }
}
