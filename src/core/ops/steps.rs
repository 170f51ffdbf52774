//! Mission step kinds, their token budgets and prompt contracts.

use serde::Deserialize;
use serde_json::Value;

use crate::core::agents::AgentProfile;
use crate::core::store::types::{MemoryType, StepPayload, status_enum};

status_enum!(
    /// Closed set of work units a mission step can perform.
    StepKind {
        ScanSignals => "scan_signals",
        ResearchTopic => "research_topic",
        AnalyzeDiscourse => "analyze_discourse",
        DistillInsight => "distill_insight",
        ClassifyPattern => "classify_pattern",
        TraceIncentive => "trace_incentive",
        IdentifyAssumption => "identify_assumption",
        DraftThread => "draft_thread",
        DraftEssay => "draft_essay",
        CritiqueContent => "critique_content",
        RefineNarrative => "refine_narrative",
        PrepareStatement => "prepare_statement",
        WriteIssue => "write_issue",
        AuditSystem => "audit_system",
        ReviewPolicy => "review_policy",
        MapDependency => "map_dependency",
        PatchCode => "patch_code",
        ConsolidateMemory => "consolidate_memory",
        DocumentLesson => "document_lesson",
        TagMemory => "tag_memory",
        ConveneRoundtable => "convene_roundtable",
        ProposeWorkflow => "propose_workflow",
        EscalateRisk => "escalate_risk",
        LogEvent => "log_event",
        Analyze => "analyze",
        Review => "review",
        Research => "research",
        Summarize => "summarize",
        WriteContent => "write_content",
        DraftTweet => "draft_tweet",
        PostTweet => "post_tweet",
        Deploy => "deploy",
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepGroup {
    Research,
    Analysis,
    Content,
    System,
    Memory,
    Meta,
    Operational,
}

/// Kinds an LLM may pick when it proposes work on its own.
pub const PROPOSABLE_KINDS: &[StepKind] = &[
    StepKind::AnalyzeDiscourse,
    StepKind::ScanSignals,
    StepKind::ResearchTopic,
    StepKind::DistillInsight,
    StepKind::ClassifyPattern,
    StepKind::DraftThread,
    StepKind::DraftEssay,
    StepKind::CritiqueContent,
    StepKind::ReviewPolicy,
    StepKind::DocumentLesson,
    StepKind::LogEvent,
    StepKind::TagMemory,
];

impl StepKind {
    pub fn group(self) -> StepGroup {
        use StepKind::*;
        match self {
            ScanSignals | ResearchTopic | AnalyzeDiscourse => StepGroup::Research,
            DistillInsight | ClassifyPattern | TraceIncentive | IdentifyAssumption => {
                StepGroup::Analysis
            }
            DraftThread | DraftEssay | CritiqueContent | RefineNarrative | PrepareStatement
            | WriteIssue => StepGroup::Content,
            AuditSystem | ReviewPolicy | MapDependency | PatchCode => StepGroup::System,
            ConsolidateMemory | DocumentLesson | TagMemory => StepGroup::Memory,
            ConveneRoundtable | ProposeWorkflow | EscalateRisk | LogEvent => StepGroup::Meta,
            Analyze | Review | Research | Summarize | WriteContent | DraftTweet | PostTweet
            | Deploy => StepGroup::Operational,
        }
    }

    pub fn token_budget(self) -> u32 {
        match self.group() {
            StepGroup::Research | StepGroup::System | StepGroup::Operational => 800,
            StepGroup::Analysis | StepGroup::Memory => 600,
            StepGroup::Content => 1200,
            StepGroup::Meta => 400,
        }
    }

    pub fn writes_memory(self) -> bool {
        self.group() == StepGroup::Memory
    }

    pub fn is_proposable(self) -> bool {
        PROPOSABLE_KINDS.contains(&self)
    }

    fn contract(self) -> (&'static str, &'static str, &'static str) {
        use StepKind::*;
        match self {
            ScanSignals => (
                "Scan current signals and discourse about",
                "Identify weak signals, emerging patterns, and relevant discourse from your perspective as {role}.",
                r#"{"signals": [{"signal": "...", "source_type": "discourse/technology/policy/market", "relevance": 0.8}], "summary": "2-3 sentence overview", "patterns": ["..."], "tags": ["..."]}"#,
            ),
            ResearchTopic | Research => (
                "Research the topic",
                "Produce a structured analysis from your perspective as {role}.",
                r#"{"findings": [{"finding": "...", "significance": "...", "confidence": 0.8}], "summary": "2-3 sentence research summary", "open_questions": ["..."], "tags": ["..."]}"#,
            ),
            AnalyzeDiscourse => (
                "Analyze the discourse around",
                "Map the rhetorical terrain, identify framing strategies, and expose assumptions.",
                r#"{"frames": [{"frame": "...", "who_benefits": "...", "what_it_hides": "..."}], "summary": "...", "power_dynamics": "...", "tags": ["..."]}"#,
            ),
            DistillInsight => (
                "Distill key insights from",
                "Extract the most important patterns and actionable knowledge.",
                r#"{"insight": "The core insight in 1-2 sentences", "reasoning": "...", "confidence": 0.75, "implications": ["..."], "tags": ["..."]}"#,
            ),
            ClassifyPattern => (
                "Classify the pattern in",
                "Identify what kind of pattern this is and where else it appears.",
                r#"{"pattern_type": "structural/behavioral/rhetorical/economic/technological", "description": "...", "instances": ["..."], "mechanism": "...", "confidence": 0.75, "tags": ["..."]}"#,
            ),
            TraceIncentive => (
                "Trace the incentive structure in",
                "Follow the money, power, and motivation. Who benefits? What behavior does this incentivize?",
                r#"{"incentive_map": [{"actor": "...", "incentive": "...", "resulting_behavior": "..."}], "summary": "...", "hidden_costs": ["..."], "tags": ["..."]}"#,
            ),
            IdentifyAssumption => (
                "Identify hidden assumptions in",
                "Surface what is being taken for granted.",
                r#"{"assumptions": [{"assumption": "...", "why_invisible": "...", "what_if_wrong": "..."}], "summary": "...", "tags": ["..."]}"#,
            ),
            DraftThread => (
                "Draft a thread about",
                "Write in your voice as {name}. Make it substantive and engaging.",
                r#"{"tweets": ["hook", "expansion", "core argument"], "hook": "...", "tags": ["..."]}"#,
            ),
            DraftEssay => (
                "Draft an essay about",
                "Write in your voice as {name}. Structured, substantive, with a clear argument.",
                r#"{"title": "...", "content": "500-1000 words", "summary": "1-2 sentence abstract", "tags": ["..."]}"#,
            ),
            CritiqueContent | Review => (
                "Critique the following",
                "Provide substantive critique from your perspective as {role}. Be honest, not harsh.",
                r#"{"strengths": ["..."], "weaknesses": ["..."], "suggestions": ["..."], "overall": "2-3 sentence assessment", "tags": ["..."]}"#,
            ),
            RefineNarrative => (
                "Refine the narrative around",
                "Improve clarity, coherence, and impact while preserving the core message.",
                r#"{"refined": "...", "changes": ["..."], "tags": ["..."]}"#,
            ),
            PrepareStatement => (
                "Prepare a formal statement about",
                "Write in your voice as {name}. Clear, measured, authoritative.",
                r#"{"statement": "...", "key_points": ["..."], "tags": ["..."]}"#,
            ),
            WriteIssue => (
                "Write a structured issue about",
                "Clear problem statement, expected behavior, and proposed solution.",
                r#"{"title": "...", "body": "...", "labels": ["..."], "priority": "high/medium/low", "tags": ["..."]}"#,
            ),
            AuditSystem => (
                "Audit the system aspect",
                "Identify risks, inefficiencies, and improvement opportunities.",
                r#"{"findings": [{"area": "...", "status": "ok/warning/critical", "detail": "..."}], "recommendations": ["..."], "risk_level": "low/medium/high", "tags": ["..."]}"#,
            ),
            ReviewPolicy => (
                "Review the policy",
                "Evaluate effectiveness, identify gaps, and suggest improvements.",
                r#"{"assessment": "...", "gaps": ["..."], "recommendations": ["..."], "tags": ["..."]}"#,
            ),
            MapDependency => (
                "Map dependencies in",
                "Identify what depends on what, bottlenecks, and single points of failure.",
                r#"{"dependencies": [{"from": "...", "to": "...", "type": "hard/soft", "risk": "..."}], "bottlenecks": ["..."], "tags": ["..."]}"#,
            ),
            PatchCode => (
                "Analyze code changes needed for",
                "Describe what should change, why, and the expected impact. Do NOT write actual code.",
                r#"{"description": "...", "rationale": "...", "impact": "...", "files_affected": ["..."], "tags": ["..."]}"#,
            ),
            ConsolidateMemory => (
                "Consolidate memories about",
                "Synthesize accumulated knowledge into a coherent understanding.",
                r#"{"synthesis": "...", "key_themes": ["..."], "memory": {"type": "pattern", "content": "...", "confidence": 0.8, "tags": ["..."]}, "tags": ["..."]}"#,
            ),
            DocumentLesson => (
                "Document a lesson from",
                "Extract a concrete, actionable lesson.",
                r#"{"lesson": "under 200 chars", "context": "...", "memory": {"type": "lesson", "content": "...", "confidence": 0.75, "tags": ["..."]}, "tags": ["..."]}"#,
            ),
            TagMemory => (
                "Tag and categorize",
                "Classify this knowledge for future retrieval.",
                r#"{"classification": "...", "reasoning": "...", "memory": {"type": "insight", "content": "...", "confidence": 0.7, "tags": ["..."]}, "tags": ["..."]}"#,
            ),
            ConveneRoundtable => (
                "Propose a roundtable conversation about",
                "What format? Who should participate? What's the key question?",
                r#"{"topic": "...", "format": "standup/checkin/triage/deep_dive/risk_review/strategy/planning/watercooler/retro/reframe", "participants": ["agent1", "agent2", "agent3"], "rationale": "...", "tags": ["..."]}"#,
            ),
            ProposeWorkflow => (
                "Propose a workflow for",
                "Define concrete steps that could become a new mission.",
                r#"{"title": "under 100 chars", "description": "...", "steps": [{"kind": "research_topic", "payload": {"description": "..."}}], "tags": ["..."]}"#,
            ),
            EscalateRisk => (
                "Escalate a risk about",
                "Describe the risk, its severity, and what should happen next.",
                r#"{"risk": "...", "severity": "low/medium/high/critical", "evidence": "...", "recommended_action": "...", "tags": ["..."]}"#,
            ),
            LogEvent => (
                "Log an event about",
                "Summarize what happened and why it matters.",
                r#"{"event": "...", "significance": "...", "tags": ["..."]}"#,
            ),
            Analyze => (
                "Analyze",
                "Diagnose what is going on from your perspective as {role} and say what should happen next.",
                r#"{"diagnosis": "...", "causes": ["..."], "next_steps": ["..."], "summary": "...", "tags": ["..."]}"#,
            ),
            Summarize => (
                "Summarize",
                "Capture what happened and what it means, briefly.",
                r#"{"summary": "...", "highlights": ["..."], "tags": ["..."]}"#,
            ),
            WriteContent => (
                "Write a short piece about",
                "Write in your voice as {name}.",
                r#"{"title": "...", "content": "...", "summary": "...", "tags": ["..."]}"#,
            ),
            DraftTweet => (
                "Draft a single post about",
                "Write in your voice as {name}. Under 280 characters.",
                r#"{"text": "...", "topic": "...", "tags": ["..."]}"#,
            ),
            PostTweet => (
                "Prepare the final text of a post about",
                "Write in your voice as {name}. Under 280 characters. It will be published as-is.",
                r#"{"text": "...", "topic": "...", "tags": ["..."]}"#,
            ),
            Deploy => (
                "Describe the deployment of",
                "List what ships, the rollback plan, and the checks to run afterwards.",
                r#"{"changes": ["..."], "rollback": "...", "checks": ["..."], "tags": ["..."]}"#,
            ),
        }
    }

    /// Render the user prompt for this kind.
    pub fn render_prompt(self, voice: &AgentProfile, payload: &StepPayload, context: &str) -> String {
        let (task, guidance, contract) = self.contract();
        let guidance = guidance
            .replace("{role}", voice.role)
            .replace("{name}", voice.display_name);
        format!(
            "TASK: {} {}\n\n{}\n\n{}\n\nOUTPUT (JSON only, no markdown fences):\n{}",
            task,
            payload.describe(),
            guidance,
            context,
            contract
        )
    }
}

/// Memory block emitted by the memory-producing kinds.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryDraft {
    #[serde(rename = "type", default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoundtableRequest {
    pub topic: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowProposal {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskEscalation {
    pub risk: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogEntry {
    pub event: String,
    #[serde(default)]
    pub significance: Option<String>,
}

/// Structured outcome of a step whose kind carries a side effect.
#[derive(Debug, Clone)]
pub enum SideEffect {
    Memory(MemoryDraft),
    Roundtable(RoundtableRequest),
    Workflow(WorkflowProposal),
    Risk(RiskEscalation),
    Log(EventLogEntry),
}

impl SideEffect {
    /// Interpret a parsed step result. `None` when the kind has no side effect or the
    /// result does not carry the fields the effect needs.
    pub fn from_result(kind: StepKind, result: &Value) -> Option<Self> {
        if kind.writes_memory() {
            let draft: MemoryDraft = serde_json::from_value(result.get("memory")?.clone()).ok()?;
            return (!draft.content.trim().is_empty()).then_some(SideEffect::Memory(draft));
        }
        match kind {
            StepKind::ConveneRoundtable => {
                serde_json::from_value(result.clone()).ok().map(SideEffect::Roundtable)
            }
            StepKind::ProposeWorkflow => serde_json::from_value::<WorkflowProposal>(result.clone())
                .ok()
                .filter(|w| !w.steps.is_empty())
                .map(SideEffect::Workflow),
            StepKind::EscalateRisk => {
                serde_json::from_value(result.clone()).ok().map(SideEffect::Risk)
            }
            StepKind::LogEvent => serde_json::from_value(result.clone()).ok().map(SideEffect::Log),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agents;
    use serde_json::json;

    #[test]
    fn budgets_follow_groups() {
        assert_eq!(StepKind::ScanSignals.token_budget(), 800);
        assert_eq!(StepKind::DistillInsight.token_budget(), 600);
        assert_eq!(StepKind::DraftEssay.token_budget(), 1200);
        assert_eq!(StepKind::LogEvent.token_budget(), 400);
        assert_eq!(StepKind::PostTweet.token_budget(), 800);
    }

    #[test]
    fn kind_names_parse_back() {
        assert_eq!(StepKind::from_status("draft_tweet"), Some(StepKind::DraftTweet));
        assert_eq!(StepKind::from_status("launch_rocket"), None);
        let kind: StepKind = serde_json::from_value(json!("convene_roundtable")).unwrap();
        assert_eq!(kind, StepKind::ConveneRoundtable);
    }

    #[test]
    fn prompt_names_the_voice_and_payload() {
        let voice = agents::profile("praxis").unwrap();
        let prompt = StepKind::DraftThread.render_prompt(
            voice,
            &StepPayload::topic("shipping cadence"),
            "PREVIOUS WORK IN THIS MISSION:\n[scan_signals] {}",
        );
        assert!(prompt.starts_with("TASK: Draft a thread about shipping cadence"));
        assert!(prompt.contains("as Praxis"));
        assert!(prompt.contains("PREVIOUS WORK IN THIS MISSION"));
        assert!(prompt.contains("\"tweets\""));
    }

    #[test]
    fn memory_side_effect_requires_content() {
        let empty = json!({"memory": {"type": "lesson", "content": "  "}});
        assert!(SideEffect::from_result(StepKind::DocumentLesson, &empty).is_none());

        let full = json!({"memory": {"type": "lesson", "content": "Ship smaller", "confidence": 0.8}});
        match SideEffect::from_result(StepKind::DocumentLesson, &full) {
            Some(SideEffect::Memory(draft)) => {
                assert_eq!(draft.memory_type, Some(MemoryType::Lesson));
                assert_eq!(draft.confidence, Some(0.8));
            }
            other => panic!("unexpected side effect: {:?}", other),
        }
    }

    #[test]
    fn plain_kinds_have_no_side_effect() {
        let result = json!({"summary": "done", "memory": {"content": "x"}});
        assert!(SideEffect::from_result(StepKind::ResearchTopic, &result).is_none());
    }

    #[test]
    fn workflow_without_steps_is_ignored() {
        let result = json!({"title": "Do things", "steps": []});
        assert!(SideEffect::from_result(StepKind::ProposeWorkflow, &result).is_none());
    }
}
