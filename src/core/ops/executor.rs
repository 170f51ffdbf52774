use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::events::EventBus;
use super::proposals::{ProposalInput, ProposalSink};
use super::recovery::MissionFinalizer;
use super::steps::{SideEffect, StepKind};
use crate::core::agents;
use crate::core::llm::{ChatMessage, GenerateOptions, Llm, extract_json};
use crate::core::roundtable::formats;
use crate::core::store::OfficeStore;
use crate::core::store::types::{
    MemoryType, MissionRecord, MissionStatus, NewEvent, NewMemory, NewSession, ProposalSource,
    ProposedStep, StepRecord, StepStatus,
};

const STEP_TEMPERATURE: f32 = 0.6;
const SIBLING_CONTEXT: usize = 3;
const SIBLING_RESULT_CHARS: usize = 300;
const RAW_RESULT_CHARS: usize = 2000;
const STEP_MEMORY_CONFIDENCE: f64 = 0.7;
const WORKFLOW_MAX_STEPS: usize = 3;
const DEFAULT_ROOM: &[&str] = &["chora", "thaum", "praxis"];

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub mission_id: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub mission_status: Option<MissionStatus>,
}

/// Executes one claimed mission step at a time in the voice of the agent that
/// owns the mission.
pub struct StepExecutor {
    store: OfficeStore,
    llm: Arc<dyn Llm>,
    events: EventBus,
    sink: Arc<dyn ProposalSink>,
    finalizer: MissionFinalizer,
    worker_id: String,
}

impl StepExecutor {
    pub fn new(
        store: OfficeStore,
        llm: Arc<dyn Llm>,
        events: EventBus,
        sink: Arc<dyn ProposalSink>,
        worker_id: impl Into<String>,
    ) -> Self {
        let finalizer = MissionFinalizer::new(store.clone(), events.clone());
        Self {
            store,
            llm,
            events,
            sink,
            finalizer,
            worker_id: worker_id.into(),
        }
    }

    /// Claim and run the next eligible step. `None` when the queue is idle.
    pub async fn run_next(&self) -> Result<Option<StepReport>> {
        let Some(step) = self.store.claim_next_step(&self.worker_id).await? else {
            return Ok(None);
        };
        info!(
            "[Missions] {} claimed step {} ({}) of mission {}",
            self.worker_id, step.id, step.kind, step.mission_id
        );
        self.execute(&step).await.map(Some)
    }

    /// Run a step that is already `running`. A model or lookup failure fails the
    /// step; it never escapes. Store failures do.
    pub async fn execute(&self, step: &StepRecord) -> Result<StepReport> {
        let mission = self.store.get_mission(&step.mission_id).await?;
        let agent_id = mission
            .as_ref()
            .map(|m| m.created_by.clone())
            .unwrap_or_else(|| "mux".to_string());

        let status = match self.produce(step, mission.as_ref()).await {
            Ok(raw) => self.succeed(step, &agent_id, &raw).await?,
            Err(e) => {
                let reason = e.to_string();
                warn!("[Missions] Step {} ({}) failed: {}", step.id, step.kind, reason);
                self.store.fail_step(&step.id, &reason).await?;
                self.events
                    .emit_quiet(
                        NewEvent::new(&agent_id, "step_failed", format!("Step failed: {}", step.kind))
                            .summary(&reason)
                            .tags(&["step", "failed", step.kind.as_str()])
                            .metadata(json!({
                                "mission_id": step.mission_id,
                                "step_id": step.id,
                                "kind": step.kind,
                            })),
                    )
                    .await;
                StepStatus::Failed
            }
        };

        let mission_status = match self.finalizer.finalize_if_complete(&step.mission_id).await {
            Ok(moved) => moved,
            Err(e) => {
                warn!("[Missions] Finalizing {} failed: {}", step.mission_id, e);
                None
            }
        };
        Ok(StepReport {
            step_id: step.id.clone(),
            mission_id: step.mission_id.clone(),
            kind: step.kind,
            status,
            mission_status,
        })
    }

    async fn produce(&self, step: &StepRecord, mission: Option<&MissionRecord>) -> Result<String> {
        let mission = mission.ok_or_else(|| anyhow!("Mission {} not found", step.mission_id))?;
        let voice = agents::step_voice(&mission.created_by);

        self.events
            .emit_quiet(
                NewEvent::new(
                    &mission.created_by,
                    "step_started",
                    format!("Step started: {}", step.kind),
                )
                .summary(format!("Mission: {}", mission.title))
                .tags(&["step", "started", step.kind.as_str()])
                .metadata(json!({
                    "mission_id": mission.id,
                    "step_id": step.id,
                    "kind": step.kind,
                })),
            )
            .await;

        let siblings = self
            .store
            .recent_succeeded_siblings(&step.mission_id, &step.id, SIBLING_CONTEXT)
            .await?;
        let context = if siblings.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = siblings
                .iter()
                .map(|s| {
                    let summary = s
                        .result
                        .as_ref()
                        .map(|r| clip(&r.to_string(), SIBLING_RESULT_CHARS))
                        .unwrap_or_else(|| "no result".to_string());
                    format!("[{}] {}", s.kind, summary)
                })
                .collect();
            format!("PREVIOUS WORK IN THIS MISSION:\n{}", lines.join("\n"))
        };

        let system = format!(
            "{}\n\nYou are executing a mission step. Output valid JSON only. \
             No markdown fences, no explanation outside the JSON.",
            voice.directive
        );
        let prompt = step.kind.render_prompt(voice, &step.payload, &context);
        let raw = self
            .llm
            .generate(
                &[ChatMessage::system(system), ChatMessage::user(prompt)],
                GenerateOptions::new(STEP_TEMPERATURE, step.kind.token_budget()),
            )
            .await?;
        Ok(raw)
    }

    /// Record the step's result. Returns the status the step ends up in, which
    /// is whatever the store already holds if the step left `running` meanwhile.
    async fn succeed(&self, step: &StepRecord, agent_id: &str, raw: &str) -> Result<StepStatus> {
        let parsed = extract_json(raw);
        let result = match &parsed {
            Some(value) => value.clone(),
            None => {
                warn!("[Missions] Step {} returned unparseable output", step.id);
                json!({"raw": clip(raw, RAW_RESULT_CHARS), "parse_error": true})
            }
        };
        if !self.store.complete_step(&step.id, &result).await? {
            let stored = self
                .store
                .get_step(&step.id)
                .await?
                .map(|s| s.status)
                .unwrap_or(StepStatus::Failed);
            warn!(
                "[Missions] Step {} was no longer running ({}), dropping its result",
                step.id, stored
            );
            return Ok(stored);
        }
        if let Some(parsed) = parsed
            && let Some(effect) = SideEffect::from_result(step.kind, &parsed)
            && let Err(e) = self.apply(step, agent_id, effect).await
        {
            warn!("[Missions] Side effect of step {} failed: {}", step.id, e);
        }

        info!("[Missions] Step {} ({}) succeeded", step.id, step.kind);
        self.events
            .emit_quiet(
                NewEvent::new(agent_id, "step_succeeded", format!("Step completed: {}", step.kind))
                    .tags(&["step", "succeeded", step.kind.as_str()])
                    .metadata(json!({
                        "mission_id": step.mission_id,
                        "step_id": step.id,
                        "kind": step.kind,
                    })),
            )
            .await;
        Ok(StepStatus::Succeeded)
    }

    async fn apply(&self, step: &StepRecord, agent_id: &str, effect: SideEffect) -> Result<()> {
        let trace = format!("mission_step:{}", step.id);
        match effect {
            SideEffect::Memory(draft) => {
                let written = self
                    .store
                    .write_memory(&NewMemory {
                        agent_id: agent_id.to_string(),
                        memory_type: draft.memory_type.unwrap_or(MemoryType::Insight),
                        content: draft.content,
                        confidence: Some(draft.confidence.unwrap_or(STEP_MEMORY_CONFIDENCE)),
                        tags: draft.tags,
                        source_trace_id: Some(trace),
                    })
                    .await?;
                if written.is_some() {
                    info!("[Missions] Step {} wrote a memory for {}", step.id, agent_id);
                }
            }
            SideEffect::Roundtable(request) => {
                let format = request
                    .format
                    .as_deref()
                    .filter(|f| formats::is_known(f))
                    .unwrap_or(formats::CONVENE_DEFAULT_FORMAT);
                let participants: Vec<String> = request
                    .participants
                    .map(|ids| ids.into_iter().filter(|id| agents::is_known(id)).collect::<Vec<_>>())
                    .filter(|ids| ids.len() >= 2)
                    .unwrap_or_else(|| DEFAULT_ROOM.iter().map(|id| id.to_string()).collect());
                let id = self
                    .store
                    .insert_session(&NewSession {
                        format: format.to_string(),
                        topic: request.topic.clone(),
                        participants,
                        schedule_slot: None,
                        scheduled_for: None,
                        metadata: json!({"source": "mission_step", "step_id": step.id}),
                    })
                    .await?;
                info!("[Missions] Step {} convened {} on \"{}\" ({})", step.id, format, request.topic, id);
            }
            SideEffect::Workflow(workflow) => {
                let steps: Vec<ProposedStep> = workflow
                    .steps
                    .into_iter()
                    .filter_map(|raw| serde_json::from_value::<ProposedStep>(raw).ok())
                    .take(WORKFLOW_MAX_STEPS)
                    .collect();
                if steps.is_empty() {
                    return Ok(());
                }
                let input = ProposalInput::new(agent_id, clip(&workflow.title, 100), steps, ProposalSource::Agent)
                    .description(clip(workflow.description.as_deref().unwrap_or_default(), 300))
                    .trace(trace);
                let outcome = self.sink.submit(input).await?;
                info!("[Missions] Step {} proposed a workflow: {:?}", step.id, outcome);
            }
            SideEffect::Risk(risk) => {
                let mut event = NewEvent::new(
                    agent_id,
                    "risk_escalated",
                    format!("Risk escalated: {}", clip(&risk.risk, 80)),
                )
                .tags(&["risk", "escalated"])
                .metadata(json!({
                    "step_id": step.id,
                    "severity": risk.severity,
                    "risk": risk.risk,
                }));
                if let Some(evidence) = risk.evidence {
                    event = event.summary(evidence);
                }
                self.events.emit(event).await?;
            }
            SideEffect::Log(entry) => {
                let mut event = NewEvent::new(agent_id, "agent_log", clip(&entry.event, 120))
                    .tags(&["log"])
                    .metadata(json!({"step_id": step.id}));
                if let Some(significance) = entry.significance {
                    event = event.summary(significance);
                }
                self.events.emit(event).await?;
            }
        }
        Ok(())
    }
}
