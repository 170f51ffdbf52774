use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::chance::Chance;
use super::events::Reactor;
use super::policy::{PolicyStore, REACTION_MATRIX, ReactionMatrixPolicy, ReactionPattern};
use super::proposals::{ProposalInput, ProposalSink};
use super::steps::StepKind;
use crate::core::store::types::{
    EventRecord, ProposalSource, ProposalStatus, ProposedStep, ReactionPayload, ReactionRecord, ReactionStatus,
    StepPayload,
};
use crate::core::store::{OfficeStore, minutes_ago};

const DRAIN_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub created: usize,
}

pub fn step_kind_for(reaction_type: &str) -> StepKind {
    match reaction_type {
        "review" | "critique" => StepKind::Review,
        "celebrate" => StepKind::Summarize,
        "support" => StepKind::WriteContent,
        _ => StepKind::Analyze,
    }
}

fn matches(pattern: &ReactionPattern, event: &EventRecord) -> bool {
    (pattern.source == "*" || pattern.source == event.agent_id)
        && pattern.target != event.agent_id
        && pattern.tags.iter().all(|t| event.tags.contains(t))
}

/// Turns events into queued cross-agent reactions and later drains that queue
/// into proposals.
pub struct ReactionMatrix {
    store: OfficeStore,
    policies: Arc<PolicyStore>,
    chance: Arc<Chance>,
}

impl ReactionMatrix {
    pub fn new(store: OfficeStore, policies: Arc<PolicyStore>, chance: Arc<Chance>) -> Self {
        Self {
            store,
            policies,
            chance,
        }
    }

    /// Queue a reaction for every pattern the event satisfies. Returns how many were queued.
    pub async fn react(&self, event: &EventRecord) -> Result<usize> {
        let matrix: ReactionMatrixPolicy = self.policies.get_as(REACTION_MATRIX).await?;
        let mut queued = 0;
        for pattern in matrix.patterns.iter().filter(|p| matches(p, event)) {
            if !self.chance.chance(pattern.probability) {
                continue;
            }
            if pattern.cooldown > 0
                && self
                    .store
                    .recent_reaction_exists(
                        &pattern.target,
                        &pattern.reaction_type,
                        &minutes_ago(pattern.cooldown),
                    )
                    .await?
            {
                continue;
            }
            let payload = ReactionPayload {
                event_title: event.title.clone(),
                event_summary: event.summary.clone(),
                event_tags: event.tags.clone(),
            };
            self.store
                .insert_reaction(
                    &event.id,
                    &event.agent_id,
                    &pattern.target,
                    &pattern.reaction_type,
                    &payload,
                )
                .await?;
            debug!(
                "[Reactions] {} will {} {}'s {}",
                pattern.target, pattern.reaction_type, event.agent_id, event.kind
            );
            queued += 1;
        }
        Ok(queued)
    }

    /// Convert queued reactions into proposals, oldest first, until the batch
    /// or the time budget runs out.
    pub async fn drain(&self, sink: &dyn ProposalSink, budget: Duration) -> Result<DrainReport> {
        let started = Instant::now();
        let mut report = DrainReport::default();

        while report.processed < DRAIN_BATCH && started.elapsed() < budget {
            let Some(reaction) = self.store.claim_reactions(1).await?.pop() else {
                break;
            };
            report.processed += 1;
            // a crashed drain can leave a reaction requeued after its proposal landed
            if let Some((proposal, mission_id)) = self
                .store
                .proposal_for_trace(&reaction_trace(&reaction.id))
                .await?
            {
                info!(
                    "[Reactions] Reaction {} already filed as proposal {}",
                    reaction.id, proposal.id
                );
                let status = if proposal.status == ProposalStatus::Rejected {
                    ReactionStatus::Failed
                } else {
                    ReactionStatus::Completed
                };
                self.store
                    .finish_reaction(
                        &reaction.id,
                        status,
                        &json!({
                            "outcome": "already_submitted",
                            "proposal_id": proposal.id,
                            "mission_id": mission_id,
                        }),
                    )
                    .await?;
                continue;
            }
            match sink.submit(reaction_proposal(&reaction)).await {
                Ok(outcome) => {
                    let status = if outcome.success() {
                        ReactionStatus::Completed
                    } else {
                        ReactionStatus::Failed
                    };
                    if outcome.mission_id().is_some() {
                        report.created += 1;
                    }
                    self.store
                        .finish_reaction(&reaction.id, status, &serde_json::to_value(&outcome)?)
                        .await?;
                }
                Err(e) => {
                    warn!("[Reactions] Failed to process reaction {}: {}", reaction.id, e);
                    self.store
                        .finish_reaction(
                            &reaction.id,
                            ReactionStatus::Failed,
                            &json!({"error": e.to_string()}),
                        )
                        .await?;
                }
            }
        }

        if report.processed > 0 {
            info!(
                "[Reactions] Drained {} reaction(s), {} mission(s) created",
                report.processed, report.created
            );
        }
        Ok(report)
    }
}

fn reaction_proposal(reaction: &ReactionRecord) -> ProposalInput {
    let mut payload = StepPayload::topic(reaction.payload.event_title.clone())
        .with("reaction_type", json!(reaction.reaction_type))
        .with("source_agent", json!(reaction.source_agent))
        .with("event_tags", json!(reaction.payload.event_tags));
    payload.description = reaction.payload.event_summary.clone();

    ProposalInput::new(
        &reaction.target_agent,
        format!("React to: {}", reaction.payload.event_title),
        vec![ProposedStep::new(step_kind_for(&reaction.reaction_type), payload)],
        ProposalSource::Reaction,
    )
    .description(format!(
        "Reaction ({}) to {}'s activity",
        reaction.reaction_type, reaction.source_agent
    ))
    .trace(reaction_trace(&reaction.id))
}

fn reaction_trace(reaction_id: &str) -> String {
    format!("reaction:{}", reaction_id)
}

#[async_trait]
impl Reactor for ReactionMatrix {
    async fn on_event(&self, event: &EventRecord) -> Result<()> {
        self.react(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ops::policy::default_policies;
    use crate::core::ops::proposals::tests::{RecordingSink, service_with_defaults};
    use crate::core::store::{test_store, ts};
    use chrono::Utc;
    use crate::core::store::types::NewEvent;

    async fn matrix(store: &OfficeStore, patterns: serde_json::Value) -> ReactionMatrix {
        store
            .set_policy_value(REACTION_MATRIX, &json!({ "patterns": patterns }))
            .await
            .unwrap();
        ReactionMatrix::new(
            store.clone(),
            Arc::new(PolicyStore::new(store.clone())),
            Arc::new(Chance::seeded(3)),
        )
    }

    async fn event(store: &OfficeStore, agent: &str, tags: &[&str]) -> EventRecord {
        store
            .insert_event(&NewEvent::new(agent, "mission_failed", "Mission failed: audit").tags(tags))
            .await
            .unwrap()
    }

    #[test]
    fn reaction_types_map_to_step_kinds() {
        assert_eq!(step_kind_for("diagnose"), StepKind::Analyze);
        assert_eq!(step_kind_for("critique"), StepKind::Review);
        assert_eq!(step_kind_for("celebrate"), StepKind::Summarize);
        assert_eq!(step_kind_for("support"), StepKind::WriteContent);
        assert_eq!(step_kind_for("shrug"), StepKind::Analyze);
    }

    #[tokio::test]
    async fn tags_source_and_self_target_filter_patterns() {
        let store = test_store().await;
        let matrix = matrix(
            &store,
            json!([
                {"source": "*", "tags": ["mission", "failed"], "target": "chora", "type": "diagnose"},
                {"source": "thaum", "tags": ["mission"], "target": "subrosa", "type": "review"},
                {"source": "*", "tags": ["risk"], "target": "subrosa", "type": "review"},
                {"source": "*", "tags": [], "target": "praxis", "type": "support"}
            ]),
        )
        .await;
        let queued = matrix
            .react(&event(&store, "praxis", &["mission", "failed"]).await)
            .await
            .unwrap();
        // only the first pattern: wrong source, missing tag, and self-target drop the rest
        assert_eq!(queued, 1);
        assert_eq!(store.count_reactions(ReactionStatus::Queued).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_repeat_reactions() {
        let store = test_store().await;
        let matrix = matrix(
            &store,
            json!([{"source": "*", "tags": ["mission"], "target": "chora", "type": "diagnose", "cooldown": 60}]),
        )
        .await;
        let e = event(&store, "mux", &["mission"]).await;
        assert_eq!(matrix.react(&e).await.unwrap(), 1);
        assert_eq!(matrix.react(&e).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_probability_never_fires() {
        let store = test_store().await;
        let matrix = matrix(
            &store,
            json!([{"source": "*", "tags": [], "target": "chora", "type": "diagnose", "probability": 0.0}]),
        )
        .await;
        assert_eq!(matrix.react(&event(&store, "mux", &[]).await).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drain_submits_reaction_proposals() {
        let store = test_store().await;
        for (key, value) in default_policies() {
            store.set_policy_value(key, &value).await.unwrap();
        }
        let matrix = matrix(
            &store,
            json!([{"source": "*", "tags": ["mission"], "target": "chora", "type": "diagnose"}]),
        )
        .await;
        matrix.react(&event(&store, "mux", &["mission"]).await).await.unwrap();

        let sink = RecordingSink::default();
        let report = matrix.drain(&sink, Duration::from_secs(3)).await.unwrap();
        assert_eq!(report, DrainReport { processed: 1, created: 1 });

        let inputs = sink.inputs.lock().unwrap();
        let input = &inputs[0];
        assert_eq!(input.agent_id, "chora");
        assert_eq!(input.title, "React to: Mission failed: audit");
        assert_eq!(input.description.as_deref(), Some("Reaction (diagnose) to mux's activity"));
        assert_eq!(input.source, ProposalSource::Reaction);
        assert!(input.source_trace_id.as_deref().unwrap().starts_with("reaction:"));
        assert_eq!(input.steps[0].kind, StepKind::Analyze);
        drop(inputs);

        assert_eq!(store.count_reactions(ReactionStatus::Completed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeued_reaction_is_not_submitted_twice() {
        let store = test_store().await;
        let service = service_with_defaults(&store).await;
        let matrix = matrix(
            &store,
            json!([{"source": "*", "tags": ["mission"], "target": "chora", "type": "diagnose"}]),
        )
        .await;
        matrix.react(&event(&store, "mux", &["mission"]).await).await.unwrap();

        // worker submits, then dies before marking the reaction finished
        let claimed = store.claim_reactions(1).await.unwrap().pop().unwrap();
        let first = service.submit(reaction_proposal(&claimed)).await.unwrap();
        assert!(first.mission_id().is_some());
        let future = ts(Utc::now() + chrono::Duration::minutes(1));
        assert_eq!(store.requeue_stale_reactions(&future).await.unwrap(), 1);

        let report = matrix.drain(&service, Duration::from_secs(3)).await.unwrap();
        assert_eq!(report, DrainReport { processed: 1, created: 0 });

        let trace = reaction_trace(&claimed.id);
        let filed = store
            .list_proposals(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.source_trace_id.as_deref() == Some(trace.as_str()))
            .count();
        assert_eq!(filed, 1);
        assert_eq!(store.list_missions(10).await.unwrap().len(), 1);
        assert_eq!(store.count_reactions(ReactionStatus::Completed).await.unwrap(), 1);
        assert_eq!(store.count_reactions(ReactionStatus::Queued).await.unwrap(), 0);
    }
}
