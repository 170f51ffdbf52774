pub mod pollers;

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use pollers::{Poller, drain, run_loop};

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Scheduling,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

/// Wraps a poller so a tick that fires while the previous one is still busy
/// is skipped instead of running alongside it.
fn guarded(poller: Arc<dyn Poller>) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
+ Send
+ Sync
+ 'static {
    let busy = Arc::new(AtomicBool::new(false));
    move || {
        let poller = poller.clone();
        let busy = busy.clone();
        Box::pin(async move {
            if busy.swap(true, Ordering::SeqCst) {
                info!("[{}] Previous run still busy, skipping tick", poller.name());
                return;
            }
            drain(poller.as_ref()).await;
            busy.store(false, Ordering::SeqCst);
        })
    }
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Run the poller on a fixed interval.
    pub async fn every(&mut self, interval: Duration, poller: Arc<dyn Poller>) -> Result<()> {
        info!("[{}] Polling every {:?}", poller.name(), interval);
        let tick = guarded(poller);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| tick())?;
        self.scheduler.add(job).await?;
        Ok(())
    }

    /// Run the poller on a six-field cron expression.
    pub async fn cron(&mut self, expression: &str, poller: Arc<dyn Poller>) -> Result<()> {
        info!("[{}] Scheduled on '{}'", poller.name(), expression);
        let tick = guarded(poller);
        let job = Job::new_async(expression, move |_uuid, _l| tick())?;
        self.scheduler.add(job).await?;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Scheduling");
        self.state = LifecycleState::Scheduling;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }

        for comp in &self.components {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}
