use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use super::proposals::{ProposalInput, ProposalSink};
use super::steps::{PROPOSABLE_KINDS, StepKind};
use crate::core::agents::{self, ROSTER};
use crate::core::llm::{ChatMessage, GenerateOptions, Llm, extract_json};
use crate::core::store::types::{
    InitiativeContext, InitiativeRecord, InitiativeStatus, MemoryQuery, MemorySnapshot, MemoryType,
    ProposalSource, ProposedStep, StepPayload,
};
use crate::core::store::{OfficeStore, minutes_ago};

const COOLDOWN_MINUTES: i64 = 4 * 60;
const MIN_HIGH_CONFIDENCE: usize = 5;
const HIGH_CONFIDENCE: f64 = 0.7;
const LESSON_CONFIDENCE: f64 = 0.55;
const SNAPSHOT_SIZE: usize = 15;
const SNAPSHOT_CONFIDENCE: f64 = 0.6;
const MAX_STEPS: usize = 3;
const INITIATIVE_TEMPERATURE: f32 = 0.7;
const INITIATIVE_TOKENS: u32 = 600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub checked: usize,
    pub queued: usize,
}

/// Heartbeat phase: queue a self-directed proposal for every agent that has
/// learned enough and is out of cooldown.
pub async fn queue_initiatives(store: &OfficeStore) -> Result<QueueReport> {
    let mut report = QueueReport {
        checked: ROSTER.len(),
        queued: 0,
    };
    for agent in ROSTER {
        match maybe_queue(store, agent.id).await {
            Ok(Some(id)) => {
                info!("[Initiatives] Queued initiative {} for {}", id, agent.id);
                report.queued += 1;
            }
            Ok(None) => {}
            Err(e) => warn!("[Initiatives] Checking {} failed: {}", agent.id, e),
        }
    }
    Ok(report)
}

async fn maybe_queue(store: &OfficeStore, agent_id: &str) -> Result<Option<String>> {
    if store
        .count_initiatives_since(agent_id, &minutes_ago(COOLDOWN_MINUTES))
        .await?
        > 0
    {
        return Ok(None);
    }

    let confident = store
        .query_memories(&MemoryQuery {
            agent_id: agent_id.to_string(),
            min_confidence: Some(HIGH_CONFIDENCE),
            limit: MIN_HIGH_CONFIDENCE,
            ..Default::default()
        })
        .await?;
    if confident.len() < MIN_HIGH_CONFIDENCE {
        return Ok(None);
    }

    let lessons = store
        .query_memories(&MemoryQuery {
            agent_id: agent_id.to_string(),
            types: vec![MemoryType::Lesson],
            min_confidence: Some(LESSON_CONFIDENCE),
            limit: 1,
            ..Default::default()
        })
        .await?;
    if lessons.is_empty() {
        return Ok(None);
    }

    let top = store
        .query_memories(&MemoryQuery {
            agent_id: agent_id.to_string(),
            min_confidence: Some(SNAPSHOT_CONFIDENCE),
            limit: SNAPSHOT_SIZE,
            ..Default::default()
        })
        .await?;
    let context = InitiativeContext {
        agent_id: agent_id.to_string(),
        memories: top.iter().map(MemorySnapshot::from).collect(),
    };
    Ok(Some(store.insert_initiative(&context).await?))
}

fn build_prompt(
    display_name: &str,
    role: &str,
    description: &str,
    memories: &[MemorySnapshot],
) -> String {
    let memory_lines: Vec<String> = memories
        .iter()
        .map(|m| format!("- [{}] ({}) {}", m.memory_type, m.confidence, m.content))
        .collect();
    let kind_lines: Vec<String> = PROPOSABLE_KINDS
        .iter()
        .map(|k| format!("- {}", k))
        .collect();
    format!(
        "You are {display_name}, a {role}. {description}\n\n\
         Based on your accumulated knowledge and observations, propose ONE actionable initiative.\n\n\
         YOUR MEMORIES:\n{memories}\n\n\
         VALID STEP KINDS:\n{kinds}\n\n\
         RULES:\n\
         - Propose exactly ONE initiative with a clear title and description\n\
         - Include 1-3 concrete steps (each with a kind from the list above)\n\
         - Ground the initiative in your memories and reference specific insights\n\
         - Keep the title under 100 characters\n\
         - Keep the description under 300 characters\n\
         - Give each step a brief payload description\n\n\
         Respond with a JSON object (no markdown, no explanation):\n\
         {{\"title\": \"Initiative title\", \"description\": \"Why this matters\", \
         \"steps\": [{{\"kind\": \"research_topic\", \"payload\": {{\"description\": \"What to research and why\"}}}}]}}",
        memories = memory_lines.join("\n"),
        kinds = kind_lines.join("\n"),
    )
}

/// Keep up to three steps whose kind may be proposed on an agent's own initiative.
pub fn proposable_steps(raw: &[Value]) -> Vec<ProposedStep> {
    raw.iter()
        .filter_map(|step| {
            let kind = StepKind::from_status(step.get("kind")?.as_str()?)?;
            if !kind.is_proposable() {
                return None;
            }
            let payload = step
                .get("payload")
                .filter(|p| p.is_object())
                .and_then(|p| serde_json::from_value::<StepPayload>(p.clone()).ok())
                .unwrap_or_default();
            Some(ProposedStep::new(kind, payload))
        })
        .take(MAX_STEPS)
        .collect()
}

/// Turns a claimed initiative entry into a proposal.
pub struct InitiativeWorker {
    store: OfficeStore,
    llm: Arc<dyn Llm>,
    sink: Arc<dyn ProposalSink>,
}

impl InitiativeWorker {
    pub fn new(store: OfficeStore, llm: Arc<dyn Llm>, sink: Arc<dyn ProposalSink>) -> Self {
        Self { store, llm, sink }
    }

    /// Claim and process the oldest pending entry. Returns the settled status, or
    /// `None` when nothing was pending.
    pub async fn run_next(&self) -> Result<Option<(String, InitiativeStatus)>> {
        let Some(entry) = self.store.claim_initiative().await? else {
            return Ok(None);
        };
        let (status, result) = match self.propose(&entry).await {
            Ok(result) => (InitiativeStatus::Completed, result),
            Err(e) => {
                warn!("[Initiatives] Initiative {} for {} failed: {}", entry.id, entry.agent_id, e);
                (InitiativeStatus::Failed, json!({"error": e.to_string()}))
            }
        };
        self.store.finish_initiative(&entry.id, status, &result).await?;
        Ok(Some((entry.id, status)))
    }

    async fn propose(&self, entry: &InitiativeRecord) -> Result<Value> {
        let agent = agents::profile(&entry.agent_id)
            .ok_or_else(|| anyhow!("Unknown agent: {}", entry.agent_id))?;
        if entry.context.memories.is_empty() {
            return Err(anyhow!("No memories in context"));
        }
        info!("[Initiatives] Processing initiative {} for {}", entry.id, agent.display_name);

        let prompt = build_prompt(
            agent.display_name,
            agent.role,
            agent.description,
            &entry.context.memories,
        );
        let raw = self
            .llm
            .generate(
                &[
                    ChatMessage::system(
                        "You are an AI agent generating a structured proposal based on your \
                         accumulated knowledge. Output valid JSON only.",
                    ),
                    ChatMessage::user(prompt),
                ],
                GenerateOptions::new(INITIATIVE_TEMPERATURE, INITIATIVE_TOKENS),
            )
            .await
            .map_err(|e| anyhow!("LLM error: {}", e))?;

        let proposal = extract_json(&raw).ok_or_else(|| anyhow!("Failed to parse LLM proposal"))?;
        let title = proposal
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("Invalid proposal structure from LLM"))?;
        let raw_steps = proposal
            .get("steps")
            .and_then(Value::as_array)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Invalid proposal structure from LLM"))?;
        let steps = proposable_steps(raw_steps);
        if steps.is_empty() {
            return Err(anyhow!("No valid steps in LLM proposal"));
        }

        let title: String = title.chars().take(100).collect();
        let description: String = proposal
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .chars()
            .take(300)
            .collect();
        let outcome = self
            .sink
            .submit(
                ProposalInput::new(agent.id, title.clone(), steps, ProposalSource::Initiative)
                    .description(description)
                    .trace(format!("initiative:{}", entry.id)),
            )
            .await?;
        info!(
            "[Initiatives] {} proposed \"{}\" ({:?})",
            agent.display_name,
            title,
            outcome.proposal_id()
        );
        Ok(json!({
            "proposal_title": title,
            "proposal_id": outcome.proposal_id(),
            "mission_id": outcome.mission_id(),
            "success": outcome.success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::mock::MockLlm;
    use crate::core::ops::proposals::tests::RecordingSink;
    use crate::core::store::test_store;
    use crate::core::store::types::NewMemory;

    async fn remember(store: &OfficeStore, agent: &str, kind: MemoryType, confidence: f64, n: usize) {
        for i in 0..n {
            store
                .write_memory(&NewMemory {
                    agent_id: agent.into(),
                    memory_type: kind,
                    content: format!("{} observation {}", kind, i),
                    confidence: Some(confidence),
                    tags: vec!["ops".into()],
                    source_trace_id: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn only_experienced_agents_are_queued_once() {
        let store = test_store().await;
        remember(&store, "chora", MemoryType::Insight, 0.8, 5).await;
        remember(&store, "chora", MemoryType::Lesson, 0.6, 1).await;
        // thaum has confidence but no lesson
        remember(&store, "thaum", MemoryType::Insight, 0.9, 6).await;

        let report = queue_initiatives(&store).await.unwrap();
        assert_eq!(report, QueueReport { checked: ROSTER.len(), queued: 1 });
        assert_eq!(queue_initiatives(&store).await.unwrap().queued, 0);

        let entry = store.claim_initiative().await.unwrap().unwrap();
        assert_eq!(entry.agent_id, "chora");
        assert_eq!(entry.context.memories.len(), 6);
    }

    #[test]
    fn steps_are_filtered_and_capped() {
        let raw = vec![
            json!({"kind": "deploy"}),
            json!({"kind": "research_topic", "payload": {"description": "why"}}),
            json!({"kind": "made_up"}),
            json!({"kind": "draft_essay", "payload": "not an object"}),
            json!({"kind": "log_event"}),
            json!({"kind": "tag_memory"}),
        ];
        let steps = proposable_steps(&raw);
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::ResearchTopic, StepKind::DraftEssay, StepKind::LogEvent]
        );
        assert_eq!(steps[0].payload.description.as_deref(), Some("why"));
    }

    #[test]
    fn prompt_lists_memories_and_kinds() {
        let prompt = build_prompt(
            "Chora",
            "Analyst",
            "Makes systems legible.",
            &[MemorySnapshot {
                id: "m1".into(),
                memory_type: MemoryType::Lesson,
                content: "Queues hide latency".into(),
                confidence: 0.8,
                tags: vec![],
            }],
        );
        assert!(prompt.starts_with("You are Chora, a Analyst. Makes systems legible."));
        assert!(prompt.contains("- [lesson] (0.8) Queues hide latency"));
        assert!(prompt.contains("- scan_signals"));
        assert!(!prompt.contains("- deploy"));
    }

    #[tokio::test]
    async fn worker_submits_traced_proposal() {
        let store = test_store().await;
        remember(&store, "praxis", MemoryType::Insight, 0.8, 5).await;
        remember(&store, "praxis", MemoryType::Lesson, 0.7, 1).await;
        queue_initiatives(&store).await.unwrap();

        let llm = Arc::new(MockLlm::replying(
            "```json\n{\"title\": \"Audit the handoffs\", \"description\": \"Handoffs stall\", \
             \"steps\": [{\"kind\": \"research_topic\", \"payload\": {\"topic\": \"handoffs\"}}]}\n```",
        ));
        let sink = Arc::new(RecordingSink::default());
        let worker = InitiativeWorker::new(store.clone(), llm.clone(), sink.clone());
        let (id, status) = worker.run_next().await.unwrap().unwrap();
        assert_eq!(status, InitiativeStatus::Completed);
        assert!(worker.run_next().await.unwrap().is_none());

        let inputs = sink.inputs.lock().unwrap().clone();
        assert_eq!(inputs[0].agent_id, "praxis");
        assert_eq!(inputs[0].source, ProposalSource::Initiative);
        assert_eq!(inputs[0].source_trace_id.as_deref(), Some(format!("initiative:{}", id).as_str()));
        let options = &llm.calls()[0].1;
        assert_eq!(options.max_tokens, INITIATIVE_TOKENS);
    }

    #[tokio::test]
    async fn invalid_reply_fails_the_entry() {
        let store = test_store().await;
        store
            .insert_initiative(&InitiativeContext {
                agent_id: "mux".into(),
                memories: vec![MemorySnapshot {
                    id: "m".into(),
                    memory_type: MemoryType::Lesson,
                    content: "x".into(),
                    confidence: 0.9,
                    tags: vec![],
                }],
            })
            .await
            .unwrap();
        let worker = InitiativeWorker::new(
            store.clone(),
            Arc::new(MockLlm::replying("{\"title\": \"No steps\", \"steps\": [{\"kind\": \"deploy\"}]}")),
            Arc::new(RecordingSink::default()),
        );
        let (_, status) = worker.run_next().await.unwrap().unwrap();
        assert_eq!(status, InitiativeStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_agent_fails_without_calling_the_model() {
        let store = test_store().await;
        store
            .insert_initiative(&InitiativeContext {
                agent_id: "ghost".into(),
                memories: Vec::new(),
            })
            .await
            .unwrap();
        let llm = Arc::new(MockLlm::new());
        let worker = InitiativeWorker::new(store.clone(), llm.clone(), Arc::new(RecordingSink::default()));
        let (_, status) = worker.run_next().await.unwrap().unwrap();
        assert_eq!(status, InitiativeStatus::Failed);
        assert_eq!(llm.call_count(), 0);
    }
}
