use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::chance::Chance;
use super::enrichment::{MemoryCache, enrich_topic};
use super::proposals::{ProposalInput, ProposalSink};
use super::steps::StepKind;
use crate::core::store::types::{
    NewTriggerRule, ProposalSource, ProposedStep, StepPayload, TriggerAction, TriggerConditions,
    TriggerRuleRecord,
};
use crate::core::store::{OfficeStore, minutes_ago, now_ts, today_start};

const DEFAULT_LOOKBACK_MINUTES: i64 = 60;
const DEFAULT_SKIP_PROBABILITY: f64 = 0.1;
const DEFAULT_JITTER_MIN: f64 = 25.0;
const DEFAULT_JITTER_MAX: f64 = 45.0;
const ENRICHMENT_MIN_CONFIDENCE: f64 = 0.6;

const SCAN_TOPICS: &[&str] = &["AI trends", "emerging tech", "startup ecosystem", "developer tools"];
const TWEET_TOPICS: &[&str] = &[
    "AI insights",
    "tech commentary",
    "productivity tips",
    "industry observations",
];
const RESEARCH_TOPICS: &[&str] = &[
    "multi-agent systems",
    "LLM optimization",
    "autonomous workflows",
    "knowledge management",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub evaluated: usize,
    pub fired: usize,
}

/// What a checker would like to propose.
#[derive(Debug, Clone)]
struct Draft {
    agent_id: String,
    title: String,
    description: String,
    step: ProposedStep,
}

fn in_cooldown(rule: &TriggerRuleRecord, now: DateTime<Utc>) -> bool {
    let Some(last) = rule
        .last_fired_at
        .as_deref()
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
    else {
        return false;
    };
    now.signed_duration_since(last.with_timezone(&Utc)) < chrono::Duration::minutes(rule.cooldown_minutes)
}

fn target(action: &TriggerAction, fallback: &str) -> String {
    action
        .target_agent
        .clone()
        .unwrap_or_else(|| fallback.to_string())
}

fn topic_pool(conditions: &TriggerConditions, defaults: &[&str]) -> Vec<String> {
    match &conditions.topics {
        Some(topics) if !topics.is_empty() => topics.clone(),
        _ => defaults.iter().map(|t| t.to_string()).collect(),
    }
}

/// Evaluates enabled trigger rules on each heartbeat and turns the ones that
/// fire into proposals.
pub struct TriggerEngine {
    store: OfficeStore,
    chance: Arc<Chance>,
}

impl TriggerEngine {
    pub fn new(store: OfficeStore, chance: Arc<Chance>) -> Self {
        Self { store, chance }
    }

    pub async fn evaluate(&self, sink: &dyn ProposalSink, budget: Duration) -> Result<TriggerReport> {
        let started = Instant::now();
        let mut report = TriggerReport::default();
        let mut cache = MemoryCache::new(&self.store, ENRICHMENT_MIN_CONFIDENCE);

        for rule in self.store.list_enabled_triggers().await? {
            if started.elapsed() > budget {
                info!("[Triggers] Budget exhausted after {} rule(s)", report.evaluated);
                break;
            }
            if in_cooldown(&rule, Utc::now()) {
                continue;
            }

            let draft = match self.check(&rule, &mut cache).await {
                Ok(Some(draft)) => draft,
                Ok(None) => {
                    report.evaluated += 1;
                    continue;
                }
                Err(CheckError::UnknownEvent) => {
                    warn!("[Triggers] No checker for event: {}", rule.trigger_event);
                    continue;
                }
                Err(CheckError::Failed(e)) => {
                    warn!("[Triggers] Error checking rule \"{}\": {}", rule.name, e);
                    continue;
                }
            };
            report.evaluated += 1;

            let Some(draft) = self.apply_cadence(&rule, draft) else {
                debug!("[Triggers] Skipped {} (skip probability)", rule.name);
                continue;
            };

            let input = ProposalInput::new(
                draft.agent_id,
                draft.title,
                vec![draft.step],
                ProposalSource::Trigger,
            )
            .description(draft.description)
            .trace(format!("trigger:{}:{}", rule.id, Utc::now().timestamp_millis()));

            match sink.submit(input).await {
                Ok(outcome) if outcome.success() => {
                    self.store.mark_trigger_fired(&rule.id, &now_ts()).await?;
                    report.fired += 1;
                    info!("[Triggers] Fired \"{}\"", rule.name);
                }
                Ok(outcome) => debug!(
                    "[Triggers] \"{}\" proposal rejected: {}",
                    rule.name,
                    outcome.reason().unwrap_or("unknown")
                ),
                Err(e) => warn!("[Triggers] Submitting \"{}\" failed: {}", rule.name, e),
            }
        }
        Ok(report)
    }

    /// Proactive rules skip now and then, and carry a jitter note so their
    /// cadence reads as irregular.
    fn apply_cadence(&self, rule: &TriggerRuleRecord, mut draft: Draft) -> Option<Draft> {
        if !rule.trigger_event.starts_with("proactive_") {
            return Some(draft);
        }
        let conditions = &rule.conditions;
        if self
            .chance
            .chance(conditions.skip_probability.unwrap_or(DEFAULT_SKIP_PROBABILITY))
        {
            return None;
        }
        let jitter = self.chance.between_f64(
            conditions.jitter_min_minutes.unwrap_or(DEFAULT_JITTER_MIN),
            conditions.jitter_max_minutes.unwrap_or(DEFAULT_JITTER_MAX),
        );
        draft.description = format!("{} [jitter: {}m]", draft.description, jitter.round() as i64)
            .trim()
            .to_string();
        Some(draft)
    }

    async fn check(
        &self,
        rule: &TriggerRuleRecord,
        cache: &mut MemoryCache<'_>,
    ) -> std::result::Result<Option<Draft>, CheckError> {
        let draft = match rule.trigger_event.as_str() {
            "mission_failed" => self.mission_failed(rule).await?,
            "content_published" => self.content_published(rule).await?,
            "proactive_scan_signals" => Some(
                self.proactive_topic(rule, cache, SCAN_TOPICS, StepKind::ScanSignals, |topic| {
                    (
                        format!("Scan signals: {}", topic),
                        format!("Proactive intelligence scan on \"{}\"", topic),
                    )
                })
                .await?,
            ),
            "proactive_draft_tweet" => Some(
                self.proactive_topic(rule, cache, TWEET_TOPICS, StepKind::DraftTweet, |topic| {
                    (
                        format!("Draft tweet: {}", topic),
                        format!("Proactive tweet draft about \"{}\"", topic),
                    )
                })
                .await?,
            ),
            "proactive_research" => Some(
                self.proactive_topic(rule, cache, RESEARCH_TOPICS, StepKind::Research, |topic| {
                    (
                        format!("Deep research: {}", topic),
                        format!("Proactive research initiative on \"{}\"", topic),
                    )
                })
                .await?,
            ),
            "proactive_analyze_ops" => Some(self.analyze_ops(rule).await?),
            _ => return Err(CheckError::UnknownEvent),
        };
        Ok(draft)
    }

    async fn mission_failed(&self, rule: &TriggerRuleRecord) -> Result<Option<Draft>> {
        let lookback = rule.conditions.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
        let failed = self
            .store
            .failed_missions_since(&minutes_ago(lookback), 3)
            .await?;
        let Some(first) = failed.first() else {
            return Ok(None);
        };
        let payload = StepPayload::topic("mission-failure-diagnosis").with(
            "failed_missions",
            json!(
                failed
                    .iter()
                    .map(|m| json!({"id": m.id, "title": m.title}))
                    .collect::<Vec<_>>()
            ),
        );
        Ok(Some(Draft {
            agent_id: target(&rule.action_config, "chora"),
            title: format!("Diagnose failed mission: {}", first.title),
            description: format!(
                "{} mission(s) failed recently. Reason: {}",
                failed.len(),
                first.failure_reason.as_deref().unwrap_or("unknown")
            ),
            step: ProposedStep::new(StepKind::Analyze, payload),
        }))
    }

    async fn content_published(&self, rule: &TriggerRuleRecord) -> Result<Option<Draft>> {
        let lookback = rule.conditions.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
        let events = self
            .store
            .events_of_kind_since("content_published", &minutes_ago(lookback), 3)
            .await?;
        if events.is_empty() {
            return Ok(None);
        }
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        Ok(Some(Draft {
            agent_id: target(&rule.action_config, "subrosa"),
            title: "Review published content".to_string(),
            description: format!("{} piece(s) of content published recently", events.len()),
            step: ProposedStep::new(
                StepKind::Review,
                StepPayload::topic("content-review").with("event_ids", json!(ids)),
            ),
        }))
    }

    async fn proactive_topic(
        &self,
        rule: &TriggerRuleRecord,
        cache: &mut MemoryCache<'_>,
        defaults: &[&str],
        kind: StepKind,
        headline: impl Fn(&str) -> (String, String),
    ) -> Result<Draft> {
        let fallback = match kind {
            StepKind::DraftTweet => "thaum",
            _ => "chora",
        };
        let agent_id = target(&rule.action_config, fallback);
        let topics = topic_pool(&rule.conditions, defaults);
        let base = self.chance.pick(&topics).cloned().unwrap_or_default();
        let enrichment = enrich_topic(cache, &self.chance, &agent_id, &base, &topics).await?;

        let (title, mut description) = headline(&enrichment.topic);
        if enrichment.memory_influenced {
            description.push_str(" [memory-influenced]");
        }
        let payload = StepPayload::topic(enrichment.topic.clone())
            .with("memoryInfluenced", json!(enrichment.memory_influenced));
        Ok(Draft {
            agent_id,
            title,
            description,
            step: ProposedStep::new(kind, payload),
        })
    }

    async fn analyze_ops(&self, rule: &TriggerRuleRecord) -> Result<Draft> {
        let since = today_start();
        let events = self.store.count_all_events_since(&since).await?;
        let missions = self.store.count_missions_created_since(&since).await?;
        Ok(Draft {
            agent_id: target(&rule.action_config, "mux"),
            title: "Analyze system operations".to_string(),
            description: format!(
                "System health review: {} events, {} missions today",
                events, missions
            ),
            step: ProposedStep::new(
                StepKind::Analyze,
                StepPayload::topic("system-health").with(
                    "context",
                    json!({"events_today": events, "missions_today": missions}),
                ),
            ),
        })
    }
}

#[derive(Debug)]
enum CheckError {
    UnknownEvent,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for CheckError {
    fn from(e: anyhow::Error) -> Self {
        CheckError::Failed(e)
    }
}

/// The rule set `init` installs. Existing rules with the same name are left alone.
pub fn starter_rules() -> Vec<NewTriggerRule> {
    fn proactive(topics: Option<&[&str]>, skip: f64) -> TriggerConditions {
        TriggerConditions {
            topics: topics.map(|t| t.iter().map(|s| s.to_string()).collect()),
            skip_probability: Some(skip),
            jitter_min_minutes: Some(DEFAULT_JITTER_MIN),
            jitter_max_minutes: Some(DEFAULT_JITTER_MAX),
            ..Default::default()
        }
    }
    fn rule(name: &str, event: &str, conditions: TriggerConditions, agent: &str, cooldown: i64) -> NewTriggerRule {
        NewTriggerRule {
            name: name.to_string(),
            trigger_event: event.to_string(),
            conditions,
            action_config: TriggerAction {
                target_agent: Some(agent.to_string()),
            },
            cooldown_minutes: cooldown,
        }
    }
    let reactive = TriggerConditions {
        lookback_minutes: Some(DEFAULT_LOOKBACK_MINUTES),
        ..Default::default()
    };

    vec![
        rule("Mission failure diagnosis", "mission_failed", reactive.clone(), "chora", 120),
        rule("Published content review", "content_published", reactive, "subrosa", 120),
        rule(
            "Proactive signal scan",
            "proactive_scan_signals",
            proactive(Some(SCAN_TOPICS), 0.1),
            "chora",
            180,
        ),
        rule(
            "Proactive tweet drafting",
            "proactive_draft_tweet",
            proactive(Some(TWEET_TOPICS), 0.15),
            "thaum",
            240,
        ),
        rule(
            "Proactive deep research",
            "proactive_research",
            proactive(Some(RESEARCH_TOPICS), 0.1),
            "chora",
            360,
        ),
        rule("Proactive ops analysis", "proactive_analyze_ops", proactive(None, 0.1), "mux", 480),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ops::proposals::SubmitOutcome;
    use crate::core::ops::proposals::tests::RecordingSink;
    use crate::core::store::test_store;
    use crate::core::store::types::{MissionStatus, NewEvent};
    use async_trait::async_trait;

    struct RejectingSink;

    #[async_trait]
    impl ProposalSink for RejectingSink {
        async fn submit(&self, _input: ProposalInput) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::Rejected {
                proposal_id: None,
                reason: "quota".into(),
            })
        }
    }

    fn never_skip(event: &str, agent: &str) -> NewTriggerRule {
        NewTriggerRule {
            name: event.to_string(),
            trigger_event: event.to_string(),
            conditions: TriggerConditions {
                skip_probability: Some(0.0),
                jitter_min_minutes: Some(30.0),
                jitter_max_minutes: Some(30.0),
                ..Default::default()
            },
            action_config: TriggerAction {
                target_agent: Some(agent.to_string()),
            },
            cooldown_minutes: 60,
        }
    }

    fn engine(store: &OfficeStore) -> TriggerEngine {
        TriggerEngine::new(store.clone(), Arc::new(Chance::seeded(11)))
    }

    #[tokio::test]
    async fn proactive_rule_fires_then_cools_down() {
        let store = test_store().await;
        store.insert_trigger(&never_skip("proactive_research", "chora")).await.unwrap();
        let engine = engine(&store);
        let sink = RecordingSink::default();

        let report = engine.evaluate(&sink, Duration::from_secs(4)).await.unwrap();
        assert_eq!(report, TriggerReport { evaluated: 1, fired: 1 });
        {
            let inputs = sink.inputs.lock().unwrap();
            let input = &inputs[0];
            assert_eq!(input.source, ProposalSource::Trigger);
            assert!(input.title.starts_with("Deep research: "));
            assert!(input.description.as_deref().unwrap().ends_with("[jitter: 30m]"));
            assert!(input.source_trace_id.as_deref().unwrap().starts_with("trigger:"));
            assert_eq!(input.steps[0].kind, StepKind::Research);
        }

        let report = engine.evaluate(&sink, Duration::from_secs(4)).await.unwrap();
        assert_eq!(report, TriggerReport::default());
        assert_eq!(store.list_enabled_triggers().await.unwrap()[0].fire_count, 1);
    }

    #[tokio::test]
    async fn rejected_submission_keeps_the_rule_ready() {
        let store = test_store().await;
        store.insert_trigger(&never_skip("proactive_scan_signals", "chora")).await.unwrap();
        let report = engine(&store)
            .evaluate(&RejectingSink, Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(report, TriggerReport { evaluated: 1, fired: 0 });
        let rule = &store.list_enabled_triggers().await.unwrap()[0];
        assert!(rule.last_fired_at.is_none());
        assert_eq!(rule.fire_count, 0);
    }

    #[tokio::test]
    async fn certain_skip_never_submits() {
        let store = test_store().await;
        let mut rule = never_skip("proactive_draft_tweet", "thaum");
        rule.conditions.skip_probability = Some(1.0);
        store.insert_trigger(&rule).await.unwrap();
        let sink = RecordingSink::default();
        let report = engine(&store).evaluate(&sink, Duration::from_secs(4)).await.unwrap();
        assert_eq!(report, TriggerReport { evaluated: 1, fired: 0 });
        assert!(sink.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mission_failed_needs_a_recent_failure() {
        let store = test_store().await;
        store
            .insert_trigger(&NewTriggerRule {
                name: "diagnose".into(),
                trigger_event: "mission_failed".into(),
                conditions: TriggerConditions::default(),
                action_config: TriggerAction::default(),
                cooldown_minutes: 60,
            })
            .await
            .unwrap();
        let sink = RecordingSink::default();
        let engine = engine(&store);
        assert_eq!(
            engine.evaluate(&sink, Duration::from_secs(4)).await.unwrap(),
            TriggerReport { evaluated: 1, fired: 0 }
        );

        let service = crate::core::ops::proposals::tests::service_with_defaults(&store).await;
        let outcome = service
            .submit(ProposalInput::new(
                "praxis",
                "Ship the audit",
                vec![ProposedStep::new(StepKind::Analyze, StepPayload::topic("audit"))],
                ProposalSource::Manual,
            ))
            .await
            .unwrap();
        let mission_id = outcome.mission_id().unwrap().to_string();
        store
            .finalize_mission(&mission_id, MissionStatus::Failed, Some("1 step(s) failed"))
            .await
            .unwrap();

        engine.evaluate(&sink, Duration::from_secs(4)).await.unwrap();
        let inputs = sink.inputs.lock().unwrap();
        assert_eq!(inputs[0].agent_id, "chora");
        assert_eq!(inputs[0].title, "Diagnose failed mission: Ship the audit");
        assert_eq!(
            inputs[0].description.as_deref(),
            Some("1 mission(s) failed recently. Reason: 1 step(s) failed")
        );
        assert_eq!(inputs[0].steps[0].payload.topic.as_deref(), Some("mission-failure-diagnosis"));
    }

    #[tokio::test]
    async fn content_published_reviews_recent_events() {
        let store = test_store().await;
        store
            .insert_trigger(&NewTriggerRule {
                name: "review".into(),
                trigger_event: "content_published".into(),
                conditions: TriggerConditions::default(),
                action_config: TriggerAction::default(),
                cooldown_minutes: 60,
            })
            .await
            .unwrap();
        store
            .insert_event(&NewEvent::new("thaum", "content_published", "Thread posted"))
            .await
            .unwrap();
        let sink = RecordingSink::default();
        engine(&store).evaluate(&sink, Duration::from_secs(4)).await.unwrap();
        let inputs = sink.inputs.lock().unwrap();
        assert_eq!(inputs[0].agent_id, "subrosa");
        assert_eq!(inputs[0].steps[0].kind, StepKind::Review);
        assert_eq!(inputs[0].description.as_deref(), Some("1 piece(s) of content published recently"));
    }

    #[tokio::test]
    async fn unknown_events_are_not_counted() {
        let store = test_store().await;
        store.insert_trigger(&never_skip("proactive_mystery", "mux")).await.unwrap();
        let report = engine(&store)
            .evaluate(&RecordingSink::default(), Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(report, TriggerReport::default());
    }

    #[test]
    fn starter_rules_have_checkers_and_unique_names() {
        let rules = starter_rules();
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), rules.len());
        assert!(rules.iter().all(|r| r.cooldown_minutes > 0));
    }
}
