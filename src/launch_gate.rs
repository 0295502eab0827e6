//! Bounded-concurrency browser launch gate
//!
//! A process-wide FIFO semaphore caps concurrent browser initializations
//! (default 1) and enforces a minimum spacing between consecutive launches.
//! The gate itself does not own browsers: each acquirer runs its
//! construction under `init_within_deadline`, and on deadline it must
//! force-close whatever was partially built before the permit returns —
//! a hung Chrome init left running leaks hundreds of megabytes.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Holds one launch slot; dropping it wakes the next FIFO waiter
#[derive(Debug)]
pub struct LaunchPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct LaunchGate {
    semaphore: Arc<Semaphore>,
    min_spacing: Duration,
    init_timeout: Duration,
    last_launch: Mutex<Option<Instant>>,
}

impl LaunchGate {
    #[must_use]
    pub fn new(max_concurrent: usize, min_spacing: Duration, init_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_spacing,
            init_timeout,
            last_launch: Mutex::new(None),
        })
    }

    /// Deadline each acquirer must apply to its browser construction
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Block until a launch slot is free, then enforce launch spacing.
    ///
    /// Waiters are woken in FIFO order. The spacing sleep happens while the
    /// permit is already held so two launches can never start closer than
    /// `min_spacing` apart even with more than one permit configured.
    pub async fn acquire(self: &Arc<Self>) -> Result<LaunchPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("launch gate closed"))?;

        let mut last = self.last_launch.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < self.min_spacing {
                let wait = self.min_spacing - since;
                debug!(wait_ms = wait.as_millis() as u64, "spacing browser launch");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        Ok(LaunchPermit { _permit: permit })
    }

    /// Run a browser-construction future under the init deadline.
    ///
    /// On deadline the future is dropped (cancelling the in-flight CDP
    /// handshake) and `InitError::Timeout` is returned; the caller still
    /// owns any partial resources it captured before the await and must
    /// close them before releasing its permit.
    pub async fn init_within_deadline<F, T>(&self, operation: F) -> Result<T, InitError>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.init_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(InitError::Failed(e)),
            Err(_) => {
                warn!(
                    timeout_secs = self.init_timeout.as_secs(),
                    "browser initialization deadline exceeded"
                );
                Err(InitError::Timeout(self.init_timeout))
            }
        }
    }
}

/// Why a gated initialization did not produce a browser
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The construction never finished inside the deadline
    #[error("browser initialization timeout after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The construction itself failed
    #[error("browser construction failed: {0}")]
    Failed(anyhow::Error),
}
