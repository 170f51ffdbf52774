use anyhow::{Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::lifecycle::{LifecycleManager, Poller, run_loop};
use crate::core::office::Office;
use crate::core::terminal::{GuideSection, print_success};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Missions,
    Roundtable,
    Initiatives,
}

impl WorkerKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "missions" => Ok(Self::Missions),
            "roundtable" => Ok(Self::Roundtable),
            "initiatives" => Ok(Self::Initiatives),
            other => bail!(
                "Unknown worker: {} (expected missions, roundtable or initiatives)",
                other
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missions => "missions",
            Self::Roundtable => "roundtable",
            Self::Initiatives => "initiatives",
        }
    }
}

fn worker_id() -> String {
    format!("worker-{}", std::process::id())
}

/// Build the poller for one worker and the interval it runs on.
fn poller(office: &Office, kind: WorkerKind) -> Result<(Arc<dyn Poller>, Duration)> {
    let llm = office.llm()?;
    let workers = &office.config.workers;
    let (poller, secs): (Arc<dyn Poller>, u64) = match kind {
        WorkerKind::Missions => (
            Arc::new(office.step_executor(llm, &worker_id())),
            workers.mission_poll_secs,
        ),
        WorkerKind::Roundtable => (Arc::new(office.orchestrator(llm)), workers.roundtable_poll_secs),
        WorkerKind::Initiatives => (
            Arc::new(office.initiative_worker(llm)),
            workers.initiative_poll_secs,
        ),
    };
    Ok((poller, Duration::from_secs(secs)))
}

/// Foreground single worker. Returns how many items it processed.
pub async fn run_worker(office: &Office, kind: WorkerKind, once: bool) -> Result<usize> {
    let (poller, interval) = poller(office, kind)?;
    Ok(run_loop(poller.as_ref(), interval, once).await)
}

/// Every worker plus the heartbeat in one process, until Ctrl+C.
pub async fn run_daemon(office: Office) -> Result<()> {
    let report = office.init().await?;
    info!(
        "[Daemon] Seeded {} polic(ies) and {} trigger(s)",
        report.policies_seeded, report.triggers_seeded
    );

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(office.store.clone())));
    for kind in [
        WorkerKind::Missions,
        WorkerKind::Roundtable,
        WorkerKind::Initiatives,
    ] {
        let (poller, interval) = poller(&office, kind)?;
        lifecycle.every(interval, poller).await?;
    }
    let heartbeat_cron = office.config.workers.heartbeat_cron.clone();
    lifecycle
        .cron(&heartbeat_cron, Arc::new(office.heartbeat()))
        .await?;
    lifecycle.start().await?;

    print_success("Office is open.");
    GuideSection::new("Daemon")
        .status("Data", &office.config.data_dir.display().to_string())
        .status("Models", &office.config.llm.models.join(" → "))
        .status("Heartbeat", &heartbeat_cron)
        .status("Worker", &worker_id())
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();

    tokio::signal::ctrl_c().await?;
    info!("[Daemon] Ctrl+C received, shutting down");
    lifecycle.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_kind_names_round_trip() {
        for kind in [
            WorkerKind::Missions,
            WorkerKind::Roundtable,
            WorkerKind::Initiatives,
        ] {
            assert_eq!(WorkerKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(
            WorkerKind::parse("payroll")
                .unwrap_err()
                .to_string()
                .contains("payroll")
        );
    }
}
