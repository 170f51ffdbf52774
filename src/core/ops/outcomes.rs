use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::steps::StepKind;
use crate::core::store::types::{MemoryType, MissionStatus, NewMemory};
use crate::core::store::{OfficeStore, minutes_ago, today_start};

const LESSONS_PER_AGENT_PER_DAY: i64 = 3;
const MISSION_LOOKBACK_MINUTES: i64 = 24 * 60;
const TWEET_LOOKBACK_MINUTES: i64 = 48 * 60;
const MISSION_BATCH: usize = 20;
const LEARNER_TRACES: &[&str] = &["mission-lesson:", "tweet-lesson:"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearnReport {
    pub tweets_learned: usize,
    pub missions_learned: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct ScoredTweet {
    step_id: String,
    agent_id: String,
    engagement: i64,
    topic: String,
}

fn engagement(result: &Value) -> i64 {
    let count = |key: &str| result.get(key).and_then(Value::as_i64).unwrap_or(0);
    count("likes") + 2 * count("retweets") + 3 * count("replies")
}

/// Heartbeat phase that turns finished work into memories.
pub struct OutcomeLearner {
    store: OfficeStore,
}

impl OutcomeLearner {
    pub fn new(store: OfficeStore) -> Self {
        Self { store }
    }

    pub async fn learn(&self) -> Result<LearnReport> {
        let report = LearnReport {
            tweets_learned: self.learn_from_tweets().await?,
            missions_learned: self.learn_from_missions().await?,
        };
        if report.tweets_learned + report.missions_learned > 0 {
            info!(
                "[Learner] Learned {} tweet and {} mission lesson(s)",
                report.tweets_learned, report.missions_learned
            );
        }
        Ok(report)
    }

    async fn under_daily_cap(&self, agent_id: &str) -> Result<bool> {
        let today = self
            .store
            .count_memories_since(agent_id, &today_start(), LEARNER_TRACES)
            .await?;
        Ok(today < LESSONS_PER_AGENT_PER_DAY)
    }

    async fn learn_from_missions(&self) -> Result<usize> {
        let missions = self
            .store
            .missions_finished_since(&minutes_ago(MISSION_LOOKBACK_MINUTES), MISSION_BATCH)
            .await?;
        let mut written = 0;
        for mission in missions {
            if !self.under_daily_cap(&mission.created_by).await? {
                continue;
            }
            let (memory_type, content, confidence, tags) = match mission.status {
                MissionStatus::Succeeded => (
                    MemoryType::Strategy,
                    format!("Mission succeeded: \"{}\". This approach works.", mission.title),
                    0.65,
                    ["mission", "succeeded"],
                ),
                MissionStatus::Failed => (
                    MemoryType::Lesson,
                    format!(
                        "Mission failed: \"{}\". Reason: {}",
                        mission.title,
                        mission
                            .failure_reason
                            .as_deref()
                            .unwrap_or("One or more steps failed")
                    ),
                    0.7,
                    ["mission", "failed"],
                ),
                _ => continue,
            };
            let id = self
                .store
                .write_memory(&NewMemory {
                    agent_id: mission.created_by.clone(),
                    memory_type,
                    content,
                    confidence: Some(confidence),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    source_trace_id: Some(format!("mission-lesson:{}", mission.id)),
                })
                .await?;
            if id.is_some() {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn learn_from_tweets(&self) -> Result<usize> {
        let steps = self
            .store
            .succeeded_steps_of_kind_since(StepKind::PostTweet, &minutes_ago(TWEET_LOOKBACK_MINUTES))
            .await?;
        let scored: Vec<ScoredTweet> = steps
            .into_iter()
            .filter_map(|(step, owner)| {
                let result = step.result?;
                let score = engagement(&result);
                let topic = result
                    .get("topic")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(step.payload.topic)
                    .unwrap_or_else(|| "unknown".to_string());
                (score > 0).then_some(ScoredTweet {
                    step_id: step.id,
                    agent_id: owner,
                    engagement: score,
                    topic,
                })
            })
            .collect();
        if scored.len() < 2 {
            return Ok(0);
        }

        let mut sorted: Vec<i64> = scored.iter().map(|t| t.engagement).collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2] as f64;

        let mut written = 0;
        for tweet in scored {
            if !self.under_daily_cap(&tweet.agent_id).await? {
                continue;
            }
            let score = tweet.engagement as f64;
            let (content, confidence, strength) = if score > median * 2.0 {
                (
                    format!(
                        "Strong tweet engagement ({}) on \"{}\". This topic and style resonate.",
                        tweet.engagement, tweet.topic
                    ),
                    0.7,
                    "strong",
                )
            } else if median > 0.0 && score < median * 0.3 {
                (
                    format!(
                        "Weak tweet engagement ({}) on \"{}\". Consider adjusting the approach for this topic.",
                        tweet.engagement, tweet.topic
                    ),
                    0.6,
                    "weak",
                )
            } else {
                continue;
            };
            let id = self
                .store
                .write_memory(&NewMemory {
                    agent_id: tweet.agent_id,
                    memory_type: MemoryType::Lesson,
                    content,
                    confidence: Some(confidence),
                    tags: vec![
                        "tweet".into(),
                        "engagement".into(),
                        strength.into(),
                        tweet.topic,
                    ],
                    source_trace_id: Some(format!("tweet-lesson:{}", tweet.step_id)),
                })
                .await?;
            if id.is_some() {
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ops::proposals::tests::service_with_defaults;
    use crate::core::ops::proposals::{ProposalInput, ProposalSink};
    use crate::core::store::test_store;
    use crate::core::store::types::{MemoryQuery, ProposalSource, ProposedStep, StepPayload};
    use serde_json::json;

    async fn finished_mission(store: &OfficeStore, agent: &str, title: &str, fail: bool) -> String {
        let service = service_with_defaults(store).await;
        let outcome = service
            .submit(ProposalInput::new(
                agent,
                title,
                vec![ProposedStep::new(StepKind::Analyze, StepPayload::topic("ops"))],
                ProposalSource::Manual,
            ))
            .await
            .unwrap();
        let mission_id = outcome.mission_id().unwrap().to_string();
        let step = store.claim_next_step("w1").await.unwrap().unwrap();
        if fail {
            store.fail_step(&step.id, "model exhausted").await.unwrap();
            store
                .finalize_mission(&mission_id, MissionStatus::Failed, Some("1 step(s) failed"))
                .await
                .unwrap();
        } else {
            store.complete_step(&step.id, &json!({"ok": true})).await.unwrap();
            store
                .finalize_mission(&mission_id, MissionStatus::Succeeded, None)
                .await
                .unwrap();
        }
        mission_id
    }

    async fn memories(store: &OfficeStore, agent: &str) -> Vec<crate::core::store::types::MemoryRecord> {
        store
            .query_memories(&MemoryQuery {
                agent_id: agent.into(),
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn engagement_weights_replies_highest() {
        assert_eq!(engagement(&json!({"likes": 10, "retweets": 2, "replies": 1})), 17);
        assert_eq!(engagement(&json!({})), 0);
    }

    #[tokio::test]
    async fn missions_become_strategies_and_lessons_once() {
        let store = test_store().await;
        finished_mission(&store, "praxis", "Ship the digest", false).await;
        finished_mission(&store, "chora", "Map the queue", true).await;

        let learner = OutcomeLearner::new(store.clone());
        let report = learner.learn().await.unwrap();
        assert_eq!(report.missions_learned, 2);
        assert_eq!(learner.learn().await.unwrap().missions_learned, 0);

        let praxis = memories(&store, "praxis").await;
        assert_eq!(praxis[0].memory_type, MemoryType::Strategy);
        assert_eq!(praxis[0].content, "Mission succeeded: \"Ship the digest\". This approach works.");
        let chora = memories(&store, "chora").await;
        assert_eq!(chora[0].memory_type, MemoryType::Lesson);
        assert!(chora[0].content.ends_with("Reason: 1 step(s) failed"));
    }

    #[tokio::test]
    async fn daily_cap_limits_lessons_per_agent() {
        let store = test_store().await;
        for n in 0..5 {
            finished_mission(&store, "mux", &format!("Batch {}", n), false).await;
        }
        let report = OutcomeLearner::new(store.clone()).learn().await.unwrap();
        assert_eq!(report.missions_learned, 3);
        assert_eq!(memories(&store, "mux").await.len(), 3);
    }
}
