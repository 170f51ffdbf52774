use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::formats;
use crate::core::agents;
use crate::core::llm::{ChatMessage, GenerateOptions, Llm, extract_json};
use crate::core::ops::proposals::{ProposalInput, ProposalSink};
use crate::core::ops::relationships::MAX_DRIFT_PER_CONVERSATION;
use crate::core::ops::steps::StepKind;
use crate::core::store::types::{
    MemoryType, NewMemory, ProposalSource, ProposedStep, SessionRecord, StepPayload, TurnRecord,
};
use crate::core::store::{MIN_MEMORY_CONFIDENCE, OfficeStore};

const MIN_TURNS: usize = 3;
const MAX_MEMORIES: usize = 6;
const MAX_ACTION_ITEMS: usize = 3;
const MAX_CONTENT_CHARS: usize = 200;
const MAX_TAGS: usize = 3;
const DISTILL_TEMPERATURE: f32 = 0.3;
const DISTILL_MAX_TOKENS: u32 = 800;

const DISTILL_SYSTEM: &str = "You are an analyst that extracts structured knowledge and relationship \
     dynamics from conversations. Output valid JSON only.";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistillReport {
    pub memories_written: usize,
    pub drifts_applied: usize,
    pub action_items: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMemory {
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub confidence: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairDrift {
    pub agent_a: String,
    pub agent_b: String,
    pub drift: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionItem {
    pub title: String,
    pub agent_id: String,
    pub step_kind: StepKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub memories: Vec<ExtractedMemory>,
    pub drifts: Vec<PairDrift>,
    pub action_items: Vec<ActionItem>,
}

#[derive(Deserialize)]
struct RawMemory {
    agent_id: String,
    #[serde(rename = "type")]
    memory_type: MemoryType,
    content: String,
    confidence: f64,
    #[serde(default)]
    tags: Vec<Value>,
}

#[derive(Deserialize)]
struct RawDrift {
    agent_a: String,
    agent_b: String,
    drift: f64,
    reason: String,
}

#[derive(Deserialize)]
struct RawActionItem {
    title: String,
    agent_id: String,
    step_kind: String,
}

fn items(value: Option<&Value>) -> &[Value] {
    value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Validate an extraction response item by item. Anything out of range is
/// dropped on its own; a bare array is read as a list of memories.
pub fn parse_extraction(response: &Value, speakers: &[String], with_action_items: bool) -> Extraction {
    let (raw_memories, raw_drifts, raw_actions) = match response {
        Value::Array(memories) => (memories.as_slice(), &[][..], &[][..]),
        Value::Object(map) if map.contains_key("memories") => (
            items(map.get("memories")),
            items(map.get("pairwise_drift")),
            items(map.get("action_items")),
        ),
        _ => return Extraction::default(),
    };
    let is_speaker = |id: &str| speakers.iter().any(|s| s == id);

    let memories = raw_memories
        .iter()
        .filter_map(|item| serde_json::from_value::<RawMemory>(item.clone()).ok())
        .filter_map(|m| {
            let length = m.content.chars().count();
            if !is_speaker(&m.agent_id)
                || length == 0
                || length > MAX_CONTENT_CHARS
                || !(MIN_MEMORY_CONFIDENCE..=1.0).contains(&m.confidence)
            {
                return None;
            }
            let tags: Vec<String> = m
                .tags
                .iter()
                .filter_map(Value::as_str)
                .filter(|t| !t.is_empty() && t.len() <= 50)
                .take(MAX_TAGS)
                .map(str::to_string)
                .collect();
            if tags.is_empty() {
                return None;
            }
            Some(ExtractedMemory {
                agent_id: m.agent_id,
                memory_type: m.memory_type,
                content: m.content,
                confidence: (m.confidence * 100.0).round() / 100.0,
                tags,
            })
        })
        .take(MAX_MEMORIES)
        .collect();

    let drifts = raw_drifts
        .iter()
        .filter_map(|item| serde_json::from_value::<RawDrift>(item.clone()).ok())
        .filter(|d| {
            d.agent_a != d.agent_b
                && is_speaker(&d.agent_a)
                && is_speaker(&d.agent_b)
                && d.drift.abs() <= MAX_DRIFT_PER_CONVERSATION
        })
        .map(|d| PairDrift {
            agent_a: d.agent_a,
            agent_b: d.agent_b,
            drift: (d.drift * 1000.0).round() / 1000.0,
            reason: d.reason.chars().take(MAX_CONTENT_CHARS).collect(),
        })
        .collect();

    let action_items = if with_action_items {
        raw_actions
            .iter()
            .filter_map(|item| serde_json::from_value::<RawActionItem>(item.clone()).ok())
            .filter_map(|a| {
                let step_kind = StepKind::from_status(&a.step_kind)?;
                (agents::is_known(&a.agent_id) && !a.title.trim().is_empty()).then(|| ActionItem {
                    title: a.title.trim().to_string(),
                    agent_id: a.agent_id,
                    step_kind,
                })
            })
            .take(MAX_ACTION_ITEMS)
            .collect()
    } else {
        Vec::new()
    };

    Extraction {
        memories,
        drifts,
        action_items,
    }
}

fn distill_prompt(transcript: &str, speakers: &[String], with_action_items: bool) -> String {
    let mut prompt = format!(
        "Analyze this conversation and extract key memories and relationship drift between participants.\n\n\
         CONVERSATION:\n{}\n\n\
         PARTICIPANTS: {}\n\n\
         MEMORY TYPES (use exactly these):\n\
         - insight: a new understanding or observation\n\
         - pattern: a recurring trend or behavior\n\
         - strategy: a successful approach or tactic\n\
         - preference: a stated preference or opinion\n\
         - lesson: something learned from a mistake or success\n\n\
         RULES FOR MEMORIES:\n\
         - At most {} memories across all participants\n\
         - Confidence between 0.0 and 1.0; only include memories with confidence >= {}\n\
         - Attribute each memory to the participant who stated or demonstrated it\n\
         - Content under {} characters, 1-3 tags each\n\n\
         RULES FOR RELATIONSHIP DRIFT:\n\
         - Only pairs who interacted meaningfully\n\
         - drift from -{max} (conflict) to +{max} (alignment), with a short reason\n",
        transcript,
        speakers.join(", "),
        MAX_MEMORIES,
        MIN_MEMORY_CONFIDENCE,
        MAX_CONTENT_CHARS,
        max = MAX_DRIFT_PER_CONVERSATION,
    );
    if with_action_items {
        prompt.push_str(&format!(
            "\nRULES FOR ACTION ITEMS:\n\
             - At most {} concrete follow-ups the group committed to\n\
             - Each names an owning agent_id and a step_kind such as analyze, research, write_content or review\n",
            MAX_ACTION_ITEMS
        ));
    }
    prompt.push_str(
        "\nRespond with a JSON object (no markdown, no explanation):\n\
         {\"memories\": [{\"agent_id\": \"chora\", \"type\": \"insight\", \"content\": \"...\", \
         \"confidence\": 0.75, \"tags\": [\"topic\"]}], \
         \"pairwise_drift\": [{\"agent_a\": \"chora\", \"agent_b\": \"praxis\", \"drift\": 0.01, \
         \"reason\": \"aligned on priorities\"}]",
    );
    if with_action_items {
        prompt.push_str(
            ", \"action_items\": [{\"title\": \"...\", \"agent_id\": \"praxis\", \"step_kind\": \"analyze\"}]",
        );
    }
    prompt.push('}');
    prompt
}

/// Turns a finished conversation into memories, affinity drift and, for
/// formats that allow it, follow-up proposals.
pub struct MemoryDistiller {
    store: OfficeStore,
    llm: Arc<dyn Llm>,
    sink: Arc<dyn ProposalSink>,
}

impl MemoryDistiller {
    pub fn new(store: OfficeStore, llm: Arc<dyn Llm>, sink: Arc<dyn ProposalSink>) -> Self {
        Self { store, llm, sink }
    }

    pub async fn distill(&self, session: &SessionRecord, turns: &[TurnRecord]) -> Result<DistillReport> {
        if turns.len() < MIN_TURNS {
            return Ok(DistillReport::default());
        }
        let mut speakers: Vec<String> = Vec::new();
        for turn in turns {
            if !speakers.contains(&turn.speaker) {
                speakers.push(turn.speaker.clone());
            }
        }
        let transcript = turns
            .iter()
            .map(|t| format!("{}: {}", t.speaker, t.dialogue))
            .collect::<Vec<_>>()
            .join("\n");
        let with_action_items = formats::get(&session.format).yields_action_items();

        let messages = [
            ChatMessage::system(DISTILL_SYSTEM),
            ChatMessage::user(distill_prompt(&transcript, &speakers, with_action_items)),
        ];
        let raw = match self
            .llm
            .generate(&messages, GenerateOptions::new(DISTILL_TEMPERATURE, DISTILL_MAX_TOKENS))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[Distiller] Extraction failed for session {}: {}", session.id, e);
                return Ok(DistillReport::default());
            }
        };
        let Some(response) = extract_json(&raw) else {
            warn!("[Distiller] Session {} produced no JSON", session.id);
            return Ok(DistillReport::default());
        };
        let extraction = parse_extraction(&response, &speakers, with_action_items);

        let mut report = DistillReport::default();
        for (index, memory) in extraction.memories.into_iter().enumerate() {
            let mut tags = memory.tags;
            tags.push("conversation".to_string());
            let written = self
                .store
                .write_memory(&NewMemory {
                    source_trace_id: Some(format!(
                        "conversation:{}:{}:{}",
                        session.id, memory.agent_id, index
                    )),
                    agent_id: memory.agent_id,
                    memory_type: memory.memory_type,
                    content: memory.content,
                    confidence: Some(memory.confidence),
                    tags,
                })
                .await?;
            if written.is_some() {
                report.memories_written += 1;
            }
        }

        for drift in &extraction.drifts {
            match self
                .store
                .apply_drift(&drift.agent_a, &drift.agent_b, drift.drift, &drift.reason, &session.id)
                .await
            {
                Ok(_) => report.drifts_applied += 1,
                Err(e) => warn!(
                    "[Distiller] Drift {}/{} failed: {}",
                    drift.agent_a, drift.agent_b, e
                ),
            }
        }

        for (index, item) in extraction.action_items.into_iter().enumerate() {
            let input = ProposalInput::new(
                item.agent_id,
                item.title.clone(),
                vec![ProposedStep::new(item.step_kind, StepPayload::topic(item.title))],
                ProposalSource::Conversation,
            )
            .description(format!("Action item from {}: {}", session.format, session.topic))
            .trace(format!("conversation:{}:action:{}", session.id, index));
            match self.sink.submit(input).await {
                Ok(outcome) if outcome.success() => report.action_items += 1,
                Ok(outcome) => info!(
                    "[Distiller] Action item rejected: {}",
                    outcome.reason().unwrap_or("unknown")
                ),
                Err(e) => warn!("[Distiller] Action item submission failed: {}", e),
            }
        }

        info!(
            "[Distiller] Session {}: {} memories, {} drifts, {} action items",
            session.id, report.memories_written, report.drifts_applied, report.action_items
        );
        Ok(report)
    }
}
