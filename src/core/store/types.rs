use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ops::steps::StepKind;

/// Declares a text-backed status enum usable as a SQLite column and a serde value.
macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_status(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                $name::from_status(text).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("unknown {} '{}'", stringify!($name), text).into(),
                    )
                })
            }
        }
    };
}

pub(crate) use status_enum;

status_enum!(ProposalStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

status_enum!(ProposalSource {
    Agent => "agent",
    Trigger => "trigger",
    Reaction => "reaction",
    Initiative => "initiative",
    Conversation => "conversation",
    Manual => "manual",
});

status_enum!(MissionStatus {
    Approved => "approved",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

status_enum!(StepStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

status_enum!(ReactionStatus {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(SessionStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(InitiativeStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(MemoryType {
    Insight => "insight",
    Pattern => "pattern",
    Strategy => "strategy",
    Preference => "preference",
    Lesson => "lesson",
});

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionStatus::Succeeded | MissionStatus::Failed)
    }
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

pub fn can_transition_mission(from: MissionStatus, to: MissionStatus) -> bool {
    use MissionStatus::*;
    matches!(
        (from, to),
        (Approved, Running) | (Approved, Succeeded) | (Approved, Failed) | (Running, Succeeded) | (Running, Failed)
    )
}

pub fn can_transition_step(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!((from, to), (Queued, Running) | (Running, Succeeded) | (Running, Failed))
}

/// Free-form step input. The well-known descriptive keys are lifted out; anything
/// else the producer attached rides along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StepPayload {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The text a prompt template should work on.
    pub fn describe(&self) -> String {
        self.topic
            .clone()
            .or_else(|| self.description.clone())
            .or_else(|| self.subject.clone())
            .unwrap_or_else(|| serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedStep {
    pub kind: StepKind,
    #[serde(default)]
    pub payload: StepPayload,
}

impl ProposedStep {
    pub fn new(kind: StepKind, payload: StepPayload) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalRecord {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub description: Option<String>,
    pub proposed_steps: Vec<ProposedStep>,
    pub status: ProposalStatus,
    pub source: ProposalSource,
    pub source_trace_id: Option<String>,
    pub auto_approved: bool,
    pub rejection_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewProposal<'a> {
    pub agent_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub steps: &'a [ProposedStep],
    pub source: ProposalSource,
    pub source_trace_id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionRecord {
    pub id: String,
    pub proposal_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: MissionStatus,
    pub created_by: String,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub mission_id: String,
    pub seq: i64,
    pub kind: StepKind,
    pub status: StepStatus,
    pub payload: StepPayload,
    pub result: Option<Value>,
    pub reserved_by: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepTally {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl StepTally {
    pub fn pending(&self) -> i64 {
        self.queued + self.running
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub agent_id: String,
    pub kind: String,
    pub title: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub agent_id: String,
    pub kind: String,
    pub title: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
}

impl NewEvent {
    pub fn new(agent_id: impl Into<String>, kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: kind.into(),
            title: title.into(),
            summary: None,
            tags: Vec::new(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-rule conditions. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_min_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_max_minutes: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRuleRecord {
    pub id: String,
    pub name: String,
    pub trigger_event: String,
    pub conditions: TriggerConditions,
    pub action_config: TriggerAction,
    pub cooldown_minutes: i64,
    pub enabled: bool,
    pub fire_count: i64,
    pub last_fired_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTriggerRule {
    pub name: String,
    pub trigger_event: String,
    pub conditions: TriggerConditions,
    pub action_config: TriggerAction,
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub event_title: String,
    #[serde(default)]
    pub event_summary: Option<String>,
    #[serde(default)]
    pub event_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionRecord {
    pub id: String,
    pub source_event_id: String,
    pub source_agent: String,
    pub target_agent: String,
    pub reaction_type: String,
    pub status: ReactionStatus,
    pub payload: ReactionPayload,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub source_trace_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub confidence: Option<f64>,
    pub tags: Vec<String>,
    pub source_trace_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub agent_id: String,
    pub types: Vec<MemoryType>,
    pub tags: Vec<String>,
    pub min_confidence: Option<f64>,
    pub limit: usize,
}

/// Aggregate view of one agent's live memories.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: i64,
    pub by_type: std::collections::HashMap<MemoryType, i64>,
    pub top_tag: Option<(String, i64)>,
}

impl MemoryStats {
    pub fn of_type(&self, memory_type: MemoryType) -> i64 {
        self.by_type.get(&memory_type).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub drift: f64,
    pub reason: String,
    pub conversation_id: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipRecord {
    pub agent_a: String,
    pub agent_b: String,
    pub affinity: f64,
    pub total_interactions: i64,
    pub positive_interactions: i64,
    pub negative_interactions: i64,
    pub drift_log: Vec<DriftEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub format: String,
    pub topic: String,
    pub participants: Vec<String>,
    pub status: SessionStatus,
    pub turn_count: i64,
    pub schedule_slot: Option<String>,
    pub scheduled_for: String,
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub format: String,
    pub topic: String,
    pub participants: Vec<String>,
    pub schedule_slot: Option<String>,
    pub scheduled_for: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub turn_number: i64,
    pub speaker: String,
    pub dialogue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&MemoryRecord> for MemorySnapshot {
    fn from(m: &MemoryRecord) -> Self {
        Self {
            id: m.id.clone(),
            memory_type: m.memory_type,
            content: m.content.clone(),
            confidence: m.confidence,
            tags: m.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitiativeContext {
    pub agent_id: String,
    #[serde(default)]
    pub memories: Vec<MemorySnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiativeRecord {
    pub id: String,
    pub agent_id: String,
    pub status: InitiativeStatus,
    pub context: InitiativeContext,
    pub result: Option<Value>,
    pub created_at: String,
}
