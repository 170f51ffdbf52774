use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info};

use crate::core::ops::executor::StepExecutor;
use crate::core::ops::heartbeat::Heartbeat;
use crate::core::ops::initiative::InitiativeWorker;
use crate::core::roundtable::RoundtableOrchestrator;

/// Upper bound on items handled by one scheduled tick, so a deep queue cannot
/// pin a worker forever.
const MAX_ITEMS_PER_TICK: usize = 20;

/// A unit of background work that handles at most one queued item per call.
#[async_trait]
pub trait Poller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns whether an item was processed.
    async fn poll_once(&self) -> Result<bool>;
}

#[async_trait]
impl Poller for StepExecutor {
    fn name(&self) -> &'static str {
        "Missions"
    }

    async fn poll_once(&self) -> Result<bool> {
        Ok(self.run_next().await?.is_some())
    }
}

#[async_trait]
impl Poller for RoundtableOrchestrator {
    fn name(&self) -> &'static str {
        "Roundtable"
    }

    async fn poll_once(&self) -> Result<bool> {
        Ok(self.run_next().await?.is_some())
    }
}

#[async_trait]
impl Poller for InitiativeWorker {
    fn name(&self) -> &'static str {
        "Initiatives"
    }

    async fn poll_once(&self) -> Result<bool> {
        Ok(self.run_next().await?.is_some())
    }
}

#[async_trait]
impl Poller for Heartbeat {
    fn name(&self) -> &'static str {
        "Heartbeat"
    }

    async fn poll_once(&self) -> Result<bool> {
        self.tick(Utc::now()).await?;
        Ok(false)
    }
}

/// Poll until the queue is empty or the per-tick cap is hit. Errors are logged
/// and end the tick; the next tick starts fresh.
pub async fn drain(poller: &dyn Poller) -> usize {
    let mut handled = 0;
    while handled < MAX_ITEMS_PER_TICK {
        match poller.poll_once().await {
            Ok(true) => handled += 1,
            Ok(false) => break,
            Err(e) => {
                error!("[{}] Poll failed: {}", poller.name(), e);
                break;
            }
        }
    }
    if handled > 0 {
        info!("[{}] Processed {} item(s)", poller.name(), handled);
    }
    handled
}

/// Foreground loop used by `work`: drain, then sleep for `interval`, until
/// Ctrl+C. With `once` a single drain is done.
pub async fn run_loop(poller: &dyn Poller, interval: Duration, once: bool) -> usize {
    let mut total = drain(poller).await;
    if once {
        return total;
    }
    info!("[{}] Worker started, polling every {:?}", poller.name(), interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[{}] Shutting down", poller.name());
                return total;
            }
            _ = tokio::time::sleep(interval) => {
                total += drain(poller).await;
            }
        }
    }
}
