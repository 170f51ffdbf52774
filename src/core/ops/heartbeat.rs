use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::chance::Chance;
use super::initiative::queue_initiatives;
use super::outcomes::OutcomeLearner;
use super::policy::{PolicyStore, SYSTEM_ENABLED, SystemPolicy};
use super::proposals::ProposalSink;
use super::reactions::ReactionMatrix;
use super::recovery::MissionFinalizer;
use super::triggers::TriggerEngine;
use crate::core::config::HeartbeatConfig;
use crate::core::roundtable::check_schedule;
use crate::core::store::OfficeStore;

fn phase<T: Serialize>(name: &str, outcome: Result<T>) -> Value {
    match outcome.and_then(|report| Ok(serde_json::to_value(report)?)) {
        Ok(value) => value,
        Err(e) => {
            error!("[Heartbeat] {} phase failed: {}", name, e);
            json!({"error": e.to_string()})
        }
    }
}

/// One periodic pass over every subsystem that needs a nudge. Each phase is
/// isolated: a failure is recorded in its slot and the next phase still runs.
pub struct Heartbeat {
    store: OfficeStore,
    policies: Arc<PolicyStore>,
    chance: Arc<Chance>,
    sink: Arc<dyn ProposalSink>,
    reactions: Arc<ReactionMatrix>,
    finalizer: MissionFinalizer,
    settings: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(
        store: OfficeStore,
        policies: Arc<PolicyStore>,
        chance: Arc<Chance>,
        sink: Arc<dyn ProposalSink>,
        reactions: Arc<ReactionMatrix>,
        finalizer: MissionFinalizer,
        settings: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            policies,
            chance,
            sink,
            reactions,
            finalizer,
            settings,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Value> {
        let started = Instant::now();
        let system: SystemPolicy = self.policies.get_as(SYSTEM_ENABLED).await?;
        if !system.enabled {
            info!("[Heartbeat] System disabled, skipping tick");
            return Ok(json!({
                "status": "disabled",
                "message": "System is disabled via policy",
            }));
        }

        let mut results = Map::new();
        let triggers = TriggerEngine::new(self.store.clone(), self.chance.clone())
            .evaluate(self.sink.as_ref(), self.settings.trigger_budget())
            .await;
        results.insert("triggers".into(), phase("Trigger", triggers));

        let reactions = self
            .reactions
            .drain(self.sink.as_ref(), self.settings.reaction_budget())
            .await;
        results.insert("reactions".into(), phase("Reaction", reactions));

        let stale = self
            .finalizer
            .sweep(
                self.settings.stale_step_minutes,
                self.settings.stale_reaction_minutes,
            )
            .await;
        results.insert("stale".into(), phase("Recovery", stale));

        let schedule = check_schedule(&self.store, &self.policies, &self.chance, now).await;
        results.insert("roundtable".into(), phase("Schedule", schedule));

        let learning = OutcomeLearner::new(self.store.clone()).learn().await;
        results.insert("learning".into(), phase("Learning", learning));

        let initiatives = queue_initiatives(&self.store).await;
        results.insert("initiatives".into(), phase("Initiative", initiatives));

        let duration_ms = started.elapsed().as_millis() as i64;
        let result = Value::Object(results);
        if let Err(e) = self
            .store
            .insert_action_run("heartbeat", "succeeded", &result, duration_ms)
            .await
        {
            error!("[Heartbeat] Failed to write audit row: {}", e);
        }
        info!("[Heartbeat] Tick finished in {}ms", duration_ms);

        let mut response = json!({"status": "ok", "duration_ms": duration_ms});
        if let (Some(out), Value::Object(phases)) = (response.as_object_mut(), result) {
            out.extend(phases);
        }
        Ok(response)
    }
}
