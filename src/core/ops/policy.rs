use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use super::steps::StepKind;
use crate::core::store::OfficeStore;

const POLICY_TTL: Duration = Duration::from_secs(30);

pub const SYSTEM_ENABLED: &str = "system_enabled";
pub const AUTO_APPROVE: &str = "auto_approve";
pub const X_DAILY_QUOTA: &str = "x_daily_quota";
pub const CONTENT_POLICY: &str = "content_policy";
pub const ROUNDTABLE_POLICY: &str = "roundtable_policy";
pub const REACTION_MATRIX: &str = "reaction_matrix";

/// Read-through policy cache in front of the store. A miss or an expired
/// entry always goes back to the store.
pub struct PolicyStore {
    store: OfficeStore,
    cache: Mutex<HashMap<String, (Value, Instant)>>,
    ttl: Duration,
}

impl PolicyStore {
    pub fn new(store: OfficeStore) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            ttl: POLICY_TTL,
        }
    }

    /// Raw policy value; `{}` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Value> {
        if let Some(value) = self.cached(key) {
            return Ok(value);
        }
        let value = self
            .store
            .get_policy_value(key)
            .await?
            .unwrap_or_else(|| json!({}));
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value.clone(), Instant::now() + self.ttl));
        Ok(value)
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(key) {
            Some((value, expires)) if Instant::now() < *expires => Some(value.clone()),
            _ => None,
        }
    }

    /// Typed view of a policy. A malformed value is logged and read as the type's default.
    pub async fn get_as<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let value = self.get(key).await?;
        Ok(serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("[Policy] {} is malformed, using defaults: {}", key, e);
            T::default()
        }))
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.store.set_policy_value(key, value).await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Master switch. An absent policy reads as disabled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemPolicy {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AutoApprovePolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Kept as text so an unknown kind in the policy does not void the whole list.
    #[serde(default)]
    pub allowed_step_kinds: Vec<String>,
}

impl AutoApprovePolicy {
    pub fn allows(&self, kinds: &[StepKind]) -> bool {
        self.enabled
            && kinds
                .iter()
                .all(|k| self.allowed_step_kinds.iter().any(|a| a == k.as_str()))
    }
}

fn default_tweet_limit() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TweetQuota {
    #[serde(default = "default_tweet_limit")]
    pub limit: i64,
}

impl Default for TweetQuota {
    fn default() -> Self {
        Self {
            limit: default_tweet_limit(),
        }
    }
}

fn default_max_drafts() -> i64 {
    8
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_drafts")]
    pub max_drafts_per_day: i64,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_drafts_per_day: default_max_drafts(),
        }
    }
}

fn default_max_conversations() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoundtablePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_conversations")]
    pub max_daily_conversations: i64,
}

impl Default for RoundtablePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily_conversations: default_max_conversations(),
        }
    }
}

fn default_probability() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReactionPattern {
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub target: String,
    #[serde(rename = "type")]
    pub reaction_type: String,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub cooldown: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReactionMatrixPolicy {
    #[serde(default)]
    pub patterns: Vec<ReactionPattern>,
}

/// Policy values written on first `init`. Existing keys are left alone.
pub fn default_policies() -> Vec<(&'static str, Value)> {
    let mut auto_kinds: Vec<&str> = [
        StepKind::ScanSignals,
        StepKind::ResearchTopic,
        StepKind::AnalyzeDiscourse,
        StepKind::DistillInsight,
        StepKind::ClassifyPattern,
        StepKind::TraceIncentive,
        StepKind::IdentifyAssumption,
        StepKind::ConsolidateMemory,
        StepKind::DocumentLesson,
        StepKind::TagMemory,
    ]
    .iter()
    .map(|k| k.as_str())
    .collect();
    auto_kinds.extend(["analyze", "review", "research", "summarize", "log_event"]);

    vec![
        (SYSTEM_ENABLED, json!({"enabled": true})),
        (
            AUTO_APPROVE,
            json!({"enabled": true, "allowed_step_kinds": auto_kinds}),
        ),
        (X_DAILY_QUOTA, json!({"limit": 5})),
        (
            CONTENT_POLICY,
            json!({"enabled": true, "max_drafts_per_day": 8}),
        ),
        (
            ROUNDTABLE_POLICY,
            json!({"enabled": true, "max_daily_conversations": 5}),
        ),
        (
            REACTION_MATRIX,
            json!({"patterns": [
                {"source": "*", "tags": ["mission", "failed"], "target": "chora", "type": "diagnose", "probability": 1.0, "cooldown": 60},
                {"source": "*", "tags": ["risk"], "target": "subrosa", "type": "review", "probability": 1.0, "cooldown": 60},
                {"source": "thaum", "tags": ["content", "published"], "target": "subrosa", "type": "critique", "probability": 0.5, "cooldown": 120},
                {"source": "*", "tags": ["mission", "succeeded"], "target": "mux", "type": "celebrate", "probability": 0.3, "cooldown": 180},
                {"source": "chora", "tags": ["insight"], "target": "praxis", "type": "support", "probability": 0.4, "cooldown": 120}
            ]}),
        ),
    ]
}
