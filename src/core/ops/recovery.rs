use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::info;

use super::events::EventBus;
use crate::core::store::types::{MissionStatus, NewEvent};
use crate::core::store::{OfficeStore, minutes_ago};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub recovered_steps: usize,
    pub requeued_reactions: usize,
}

/// Closes missions once their steps are done, and reclaims work that a dead
/// worker left behind.
#[derive(Clone)]
pub struct MissionFinalizer {
    store: OfficeStore,
    events: EventBus,
}

impl MissionFinalizer {
    pub fn new(store: OfficeStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Settle the mission if no step is still queued or running. Safe to call
    /// repeatedly: a mission that is already terminal is left alone and emits nothing.
    /// Returns the status it moved to, if it moved.
    pub async fn finalize_if_complete(&self, mission_id: &str) -> Result<Option<MissionStatus>> {
        let tally = self.store.step_tally(mission_id).await?;
        if tally.pending() > 0 {
            return Ok(None);
        }
        let Some(mission) = self.store.get_mission(mission_id).await? else {
            return Ok(None);
        };
        if mission.status.is_terminal() {
            return Ok(None);
        }

        if tally.failed > 0 {
            let reason = format!("{} step(s) failed", tally.failed);
            if !self
                .store
                .finalize_mission(mission_id, MissionStatus::Failed, Some(&reason))
                .await?
            {
                return Ok(None);
            }
            info!("[Missions] Mission {} failed: {}", mission_id, reason);
            self.events
                .emit_quiet(
                    NewEvent::new(
                        &mission.created_by,
                        "mission_failed",
                        format!("Mission failed: {}", mission.title),
                    )
                    .summary(&reason)
                    .tags(&["mission", "failed"])
                    .metadata(json!({"mission_id": mission_id, "failed_steps": tally.failed})),
                )
                .await;
            Ok(Some(MissionStatus::Failed))
        } else {
            if !self
                .store
                .finalize_mission(mission_id, MissionStatus::Succeeded, None)
                .await?
            {
                return Ok(None);
            }
            info!("[Missions] Mission {} succeeded", mission_id);
            self.events
                .emit_quiet(
                    NewEvent::new(
                        &mission.created_by,
                        "mission_succeeded",
                        format!("Mission completed: {}", mission.title),
                    )
                    .tags(&["mission", "succeeded"])
                    .metadata(json!({"mission_id": mission_id})),
                )
                .await;
            Ok(Some(MissionStatus::Succeeded))
        }
    }

    /// Fail steps stuck in `running` past the threshold and settle their missions.
    pub async fn recover_stale_steps(&self, stale_minutes: i64) -> Result<usize> {
        let reason = format!("Recovered: step exceeded {} minute timeout", stale_minutes);
        let stale = self
            .store
            .recover_stale_steps(&minutes_ago(stale_minutes), &reason)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let missions: BTreeSet<&str> = stale.iter().map(|(_, mission)| mission.as_str()).collect();
        for mission_id in &missions {
            self.finalize_if_complete(mission_id).await?;
        }

        let step_ids: Vec<&str> = stale.iter().map(|(step, _)| step.as_str()).collect();
        info!("[Recovery] Recovered {} stale step(s)", stale.len());
        self.events
            .emit_quiet(
                NewEvent::new(
                    "mux",
                    "stale_steps_recovered",
                    format!("Recovered {} stale step(s)", stale.len()),
                )
                .summary(format!("Steps exceeded {}min timeout", stale_minutes))
                .tags(&["recovery", "stale"])
                .metadata(json!({"step_ids": step_ids, "mission_ids": missions})),
            )
            .await;
        Ok(stale.len())
    }

    pub async fn requeue_stale_reactions(&self, stale_minutes: i64) -> Result<usize> {
        let requeued = self
            .store
            .requeue_stale_reactions(&minutes_ago(stale_minutes))
            .await?;
        if requeued > 0 {
            info!("[Recovery] Requeued {} stale reaction(s)", requeued);
        }
        Ok(requeued)
    }

    pub async fn sweep(&self, stale_step_minutes: i64, stale_reaction_minutes: i64) -> Result<RecoveryReport> {
        Ok(RecoveryReport {
            recovered_steps: self.recover_stale_steps(stale_step_minutes).await?,
            requeued_reactions: self.requeue_stale_reactions(stale_reaction_minutes).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ops::proposals::tests::service_with_defaults;
    use crate::core::ops::proposals::{ProposalInput, ProposalSink};
    use crate::core::ops::steps::StepKind;
    use crate::core::store::test_store;
    use crate::core::store::types::{
        ProposalSource, ProposedStep, ReactionPayload, ReactionStatus, StepPayload, StepStatus,
    };

    async fn mission(store: &OfficeStore, steps: usize) -> String {
        let service = service_with_defaults(store).await;
        let outcome = service
            .submit(ProposalInput::new(
                "praxis",
                "Audit",
                (0..steps)
                    .map(|_| ProposedStep::new(StepKind::Analyze, StepPayload::topic("ops")))
                    .collect(),
                ProposalSource::Manual,
            ))
            .await
            .unwrap();
        outcome.mission_id().unwrap().to_string()
    }

    fn finalizer(store: &OfficeStore) -> MissionFinalizer {
        MissionFinalizer::new(store.clone(), EventBus::new(store.clone()))
    }

    #[tokio::test]
    async fn finalize_waits_for_pending_steps_and_runs_once() {
        let store = test_store().await;
        let mission_id = mission(&store, 2).await;
        let finalizer = finalizer(&store);

        let first = store.claim_next_step("w1").await.unwrap().unwrap();
        store.complete_step(&first.id, &json!({"ok": true})).await.unwrap();
        assert_eq!(finalizer.finalize_if_complete(&mission_id).await.unwrap(), None);

        let second = store.claim_next_step("w1").await.unwrap().unwrap();
        store.fail_step(&second.id, "model exhausted").await.unwrap();
        assert_eq!(
            finalizer.finalize_if_complete(&mission_id).await.unwrap(),
            Some(MissionStatus::Failed)
        );
        assert_eq!(finalizer.finalize_if_complete(&mission_id).await.unwrap(), None);

        let mission = store.get_mission(&mission_id).await.unwrap().unwrap();
        assert_eq!(mission.failure_reason.as_deref(), Some("1 step(s) failed"));
        let failures = store
            .count_events_since("mission_failed", &minutes_ago(5))
            .await
            .unwrap();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn stale_running_step_is_failed_and_mission_settled() {
        let store = test_store().await;
        let mission_id = mission(&store, 1).await;
        let step = store.claim_next_step("w1").await.unwrap().unwrap();
        store.set_step_updated_at(&step.id, &minutes_ago(40)).await.unwrap();

        let report = finalizer(&store).sweep(30, 30).await.unwrap();
        assert_eq!(report.recovered_steps, 1);

        let step = store.get_step(&step.id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(
            step.failure_reason.as_deref(),
            Some("Recovered: step exceeded 30 minute timeout")
        );
        let mission = store.get_mission(&mission_id).await.unwrap().unwrap();
        assert_eq!(mission.status, MissionStatus::Failed);
        assert_eq!(
            store.list_events(5).await.unwrap()[0].kind,
            "stale_steps_recovered"
        );
    }

    #[tokio::test]
    async fn fresh_running_step_is_left_alone() {
        let store = test_store().await;
        mission(&store, 1).await;
        store.claim_next_step("w1").await.unwrap().unwrap();
        assert_eq!(finalizer(&store).recover_stale_steps(30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stuck_reactions_go_back_to_the_queue() {
        let store = test_store().await;
        let id = store
            .insert_reaction(
                "e1",
                "mux",
                "chora",
                "diagnose",
                &ReactionPayload {
                    event_title: "Mission failed: x".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.claim_reactions(1).await.unwrap();
        store.set_reaction_updated_at(&id, &minutes_ago(45)).await.unwrap();

        assert_eq!(finalizer(&store).requeue_stale_reactions(30).await.unwrap(), 1);
        assert_eq!(store.count_reactions(ReactionStatus::Queued).await.unwrap(), 1);
    }
}
