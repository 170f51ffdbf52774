use anyhow::Result;
use std::sync::Arc;

use super::policy::{CONTENT_POLICY, ContentPolicy, PolicyStore, TweetQuota, X_DAILY_QUOTA};
use super::steps::StepKind;
use crate::core::store::types::StepStatus;
use crate::core::store::{OfficeStore, today_start};

/// Step states that count against a daily quota.
const COUNTED: &[StepStatus] = &[StepStatus::Queued, StepStatus::Running, StepStatus::Succeeded];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Open,
    Closed(String),
}

impl GateResult {
    pub fn is_open(&self) -> bool {
        matches!(self, GateResult::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    TweetQuota,
    ContentQuota,
    Deploy,
}

fn gate_for(kind: StepKind) -> Option<Gate> {
    match kind {
        StepKind::PostTweet => Some(Gate::TweetQuota),
        StepKind::WriteContent | StepKind::DraftTweet => Some(Gate::ContentQuota),
        StepKind::Deploy => Some(Gate::Deploy),
        _ => None,
    }
}

/// Quota checks applied to a proposal's step kinds before it is accepted.
pub struct CapGates {
    store: OfficeStore,
    policies: Arc<PolicyStore>,
}

impl CapGates {
    pub fn new(store: OfficeStore, policies: Arc<PolicyStore>) -> Self {
        Self { store, policies }
    }

    /// The first closed gate wins.
    pub async fn check(&self, kinds: &[StepKind]) -> Result<GateResult> {
        for kind in kinds {
            let Some(gate) = gate_for(*kind) else {
                continue;
            };
            let result = match gate {
                Gate::TweetQuota => self.tweet_quota().await?,
                Gate::ContentQuota => self.content_quota().await?,
                Gate::Deploy => GateResult::Closed("Deploy steps require manual approval".into()),
            };
            if !result.is_open() {
                return Ok(result);
            }
        }
        Ok(GateResult::Open)
    }

    async fn tweet_quota(&self) -> Result<GateResult> {
        let quota: TweetQuota = self.policies.get_as(X_DAILY_QUOTA).await?;
        let today = self
            .store
            .count_steps_since(&[StepKind::PostTweet], COUNTED, &today_start())
            .await?;
        if today >= quota.limit {
            return Ok(GateResult::Closed(format!(
                "Tweet quota full ({}/{})",
                today, quota.limit
            )));
        }
        Ok(GateResult::Open)
    }

    async fn content_quota(&self) -> Result<GateResult> {
        let policy: ContentPolicy = self.policies.get_as(CONTENT_POLICY).await?;
        if !policy.enabled {
            return Ok(GateResult::Open);
        }
        let today = self
            .store
            .count_steps_since(
                &[StepKind::WriteContent, StepKind::DraftTweet],
                COUNTED,
                &today_start(),
            )
            .await?;
        if today >= policy.max_drafts_per_day {
            return Ok(GateResult::Closed(format!(
                "Content quota full ({}/{})",
                today, policy.max_drafts_per_day
            )));
        }
        Ok(GateResult::Open)
    }
}
