use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::cap_gates::{CapGates, GateResult};
use super::events::EventBus;
use super::policy::{AUTO_APPROVE, AutoApprovePolicy, PolicyStore};
use super::steps::StepKind;
use crate::core::agents::DAILY_PROPOSAL_LIMIT;
use crate::core::store::types::{NewEvent, NewProposal, ProposalSource, ProposalStatus, ProposedStep};
use crate::core::store::{OfficeStore, today_start};

#[derive(Debug, Clone)]
pub struct ProposalInput {
    pub agent_id: String,
    pub title: String,
    pub description: Option<String>,
    pub steps: Vec<ProposedStep>,
    pub source: ProposalSource,
    pub source_trace_id: Option<String>,
}

impl ProposalInput {
    pub fn new(
        agent_id: impl Into<String>,
        title: impl Into<String>,
        steps: Vec<ProposedStep>,
        source: ProposalSource,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            title: title.into(),
            description: None,
            steps,
            source,
            source_trace_id: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn trace(mut self, trace: impl Into<String>) -> Self {
        self.source_trace_id = Some(trace.into());
        self
    }
}

/// What happened to a submission. Rejections are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Approved {
        proposal_id: String,
        mission_id: String,
    },
    Pending {
        proposal_id: String,
    },
    Rejected {
        proposal_id: Option<String>,
        reason: String,
    },
}

impl SubmitOutcome {
    pub fn success(&self) -> bool {
        !self.rejected()
    }

    pub fn rejected(&self) -> bool {
        matches!(self, SubmitOutcome::Rejected { .. })
    }

    pub fn proposal_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Approved { proposal_id, .. } | SubmitOutcome::Pending { proposal_id } => {
                Some(proposal_id)
            }
            SubmitOutcome::Rejected { proposal_id, .. } => proposal_id.as_deref(),
        }
    }

    pub fn mission_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Approved { mission_id, .. } => Some(mission_id),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Anything that can accept a proposal. Producers depend on this rather than
/// on the concrete service.
#[async_trait]
pub trait ProposalSink: Send + Sync {
    async fn submit(&self, input: ProposalInput) -> Result<SubmitOutcome>;
}

/// The one write path for proposals: daily limit, cap gates, auto-approval
/// and mission creation all happen here.
pub struct ProposalService {
    store: OfficeStore,
    policies: Arc<PolicyStore>,
    gates: CapGates,
    events: EventBus,
}

impl ProposalService {
    pub fn new(store: OfficeStore, policies: Arc<PolicyStore>, events: EventBus) -> Self {
        let gates = CapGates::new(store.clone(), policies.clone());
        Self {
            store,
            policies,
            gates,
            events,
        }
    }
}

#[async_trait]
impl ProposalSink for ProposalService {
    async fn submit(&self, input: ProposalInput) -> Result<SubmitOutcome> {
        let today = self
            .store
            .count_proposals_since(&input.agent_id, &today_start())
            .await?;
        if today >= DAILY_PROPOSAL_LIMIT {
            let reason = format!(
                "Agent {} hit daily proposal limit ({}/{})",
                input.agent_id, today, DAILY_PROPOSAL_LIMIT
            );
            info!("[Proposals] {}", reason);
            return Ok(SubmitOutcome::Rejected {
                proposal_id: None,
                reason,
            });
        }

        let kinds: Vec<StepKind> = input.steps.iter().map(|s| s.kind).collect();
        let record = NewProposal {
            agent_id: &input.agent_id,
            title: &input.title,
            description: input.description.as_deref(),
            steps: &input.steps,
            source: input.source,
            source_trace_id: input.source_trace_id.as_deref(),
        };

        let gate = if kinds.is_empty() {
            GateResult::Closed("Proposal has no steps".to_string())
        } else {
            self.gates.check(&kinds).await?
        };
        if let GateResult::Closed(reason) = gate {
            let proposal_id = self
                .store
                .insert_proposal(&record, ProposalStatus::Rejected, Some(&reason))
                .await?;
            info!("[Proposals] Rejected \"{}\" from {}: {}", input.title, input.agent_id, reason);
            self.events
                .emit_quiet(
                    NewEvent::new(
                        &input.agent_id,
                        "proposal_rejected",
                        format!("Proposal rejected: {}", input.title),
                    )
                    .summary(&reason)
                    .tags(&["proposal", "rejected", "gate"])
                    .metadata(json!({"proposal_id": proposal_id})),
                )
                .await;
            return Ok(SubmitOutcome::Rejected {
                proposal_id: Some(proposal_id),
                reason,
            });
        }

        let proposal_id = self
            .store
            .insert_proposal(&record, ProposalStatus::Pending, None)
            .await?;

        let auto: AutoApprovePolicy = self.policies.get_as(AUTO_APPROVE).await?;
        if auto.allows(&kinds) {
            let mission = self
                .store
                .accept_proposal_with_mission(
                    &proposal_id,
                    &input.agent_id,
                    &input.title,
                    input.description.as_deref(),
                    &input.steps,
                )
                .await?;
            match mission {
                Some(mission_id) => {
                    info!(
                        "[Proposals] Auto-approved \"{}\" from {} as mission {}",
                        input.title, input.agent_id, mission_id
                    );
                    self.events
                        .emit_quiet(
                            NewEvent::new(
                                &input.agent_id,
                                "proposal_approved",
                                format!("Proposal auto-approved: {}", input.title),
                            )
                            .summary(format!("Mission created with {} step(s)", input.steps.len()))
                            .tags(&["proposal", "approved", "auto"])
                            .metadata(json!({"proposal_id": proposal_id, "mission_id": mission_id})),
                        )
                        .await;
                    return Ok(SubmitOutcome::Approved {
                        proposal_id,
                        mission_id,
                    });
                }
                None => warn!(
                    "[Proposals] Proposal {} left pending before it could be accepted",
                    proposal_id
                ),
            }
        }

        self.events
            .emit_quiet(
                NewEvent::new(
                    &input.agent_id,
                    "proposal_pending",
                    format!("Proposal pending: {}", input.title),
                )
                .summary(format!("Awaiting review ({} step(s))", input.steps.len()))
                .tags(&["proposal", "pending"])
                .metadata(json!({"proposal_id": proposal_id})),
            )
            .await;
        Ok(SubmitOutcome::Pending { proposal_id })
    }
}
