use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::core::config::OfficeConfig;
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::llm::{Llm, LlmManager};
use crate::core::ops::chance::Chance;
use crate::core::ops::events::EventBus;
use crate::core::ops::executor::StepExecutor;
use crate::core::ops::heartbeat::Heartbeat;
use crate::core::ops::initiative::InitiativeWorker;
use crate::core::ops::policy::{PolicyStore, default_policies};
use crate::core::ops::proposals::ProposalService;
use crate::core::ops::reactions::ReactionMatrix;
use crate::core::ops::recovery::MissionFinalizer;
use crate::core::ops::relationships::seed_relationships;
use crate::core::ops::triggers::starter_rules;
use crate::core::ops::voice::VoiceEvolution;
use crate::core::roundtable::{MemoryDistiller, RoundtableOrchestrator};
use crate::core::store::OfficeStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub relationships: usize,
    pub policies_seeded: usize,
    pub triggers_seeded: usize,
}

/// Every long-lived component of one office process, wired the same way for
/// the daemon, the single-shot commands and the tests.
pub struct Office {
    pub config: OfficeConfig,
    pub store: OfficeStore,
    pub policies: Arc<PolicyStore>,
    pub chance: Arc<Chance>,
    pub events: EventBus,
    pub proposals: Arc<ProposalService>,
    pub reactions: Arc<ReactionMatrix>,
    pub voices: Arc<VoiceEvolution>,
}

impl Office {
    pub async fn open(config: OfficeConfig) -> Result<Self> {
        let store = OfficeStore::open(&config.data_dir).await?;
        Ok(Self::assemble(config, store, Arc::new(Chance::from_entropy())))
    }

    pub fn assemble(config: OfficeConfig, store: OfficeStore, chance: Arc<Chance>) -> Self {
        let policies = Arc::new(PolicyStore::new(store.clone()));
        let reactions = Arc::new(ReactionMatrix::new(
            store.clone(),
            policies.clone(),
            chance.clone(),
        ));
        let events = EventBus::new(store.clone()).with_reactor(reactions.clone());
        let proposals = Arc::new(ProposalService::new(
            store.clone(),
            policies.clone(),
            events.clone(),
        ));
        let voices = Arc::new(VoiceEvolution::new(store.clone()));
        Self {
            config,
            store,
            policies,
            chance,
            events,
            proposals,
            reactions,
            voices,
        }
    }

    /// Install relationships, default policies and starter triggers. Existing
    /// rows are kept, so running it twice changes nothing.
    pub async fn init(&self) -> Result<InitReport> {
        let mut report = InitReport {
            relationships: seed_relationships(&self.store).await?,
            ..Default::default()
        };
        for (key, value) in default_policies() {
            if self.store.seed_policy_value(key, &value).await? {
                report.policies_seeded += 1;
            }
        }
        for rule in starter_rules() {
            if self.store.insert_trigger(&rule).await? {
                report.triggers_seeded += 1;
            }
        }
        self.policies.clear();
        info!(
            "[Office] Initialized: {} relationship(s), {} polic(ies), {} trigger(s)",
            report.relationships, report.policies_seeded, report.triggers_seeded
        );
        Ok(report)
    }

    /// The configured model chain. Fails when no API key is available.
    pub fn llm(&self) -> Result<Arc<dyn Llm>> {
        let llm = &self.config.llm;
        let key = llm.require_api_key()?.to_string();
        let provider = GenericProvider::new("openai-compatible", llm.base_url.clone(), key);
        let manager = LlmManager::new(Box::new(provider), llm.models.clone())
            .with_timeout(llm.timeout())
            .with_retries(llm.max_retries, llm.retry_base());
        Ok(Arc::new(manager))
    }

    pub fn finalizer(&self) -> MissionFinalizer {
        MissionFinalizer::new(self.store.clone(), self.events.clone())
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(
            self.store.clone(),
            self.policies.clone(),
            self.chance.clone(),
            self.proposals.clone(),
            self.reactions.clone(),
            self.finalizer(),
            self.config.heartbeat.clone(),
        )
    }

    pub fn step_executor(&self, llm: Arc<dyn Llm>, worker_id: &str) -> StepExecutor {
        StepExecutor::new(
            self.store.clone(),
            llm,
            self.events.clone(),
            self.proposals.clone(),
            worker_id,
        )
    }

    pub fn orchestrator(&self, llm: Arc<dyn Llm>) -> RoundtableOrchestrator {
        let distiller = MemoryDistiller::new(self.store.clone(), llm.clone(), self.proposals.clone());
        RoundtableOrchestrator::new(
            self.store.clone(),
            llm,
            self.events.clone(),
            self.voices.clone(),
            distiller,
            self.chance.clone(),
        )
        .with_turn_delay(self.config.workers.turn_delay)
    }

    pub fn initiative_worker(&self, llm: Arc<dyn Llm>) -> InitiativeWorker {
        InitiativeWorker::new(self.store.clone(), llm, self.proposals.clone())
    }

    pub async fn status(&self) -> Result<Value> {
        let mut snapshot = self.store.status_snapshot().await?;
        let runs = self.store.recent_action_runs(1).await?;
        snapshot["last_heartbeat"] = runs
            .first()
            .map(|run| json!({"status": run.status, "at": run.created_at, "duration_ms": run.duration_ms}))
            .unwrap_or(Value::Null);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::mock::MockLlm;
    use crate::core::ops::proposals::{ProposalInput, ProposalSink};
    use crate::core::ops::steps::StepKind;
    use crate::core::store::test_store;
    use crate::core::store::types::{ProposalSource, ProposedStep, StepPayload, StepStatus};

    async fn office() -> Office {
        let store = test_store().await;
        let mut config = OfficeConfig::default();
        config.workers.turn_delay = false;
        Office::assemble(config, store, Arc::new(Chance::seeded(11)))
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let office = office().await;
        let first = office.init().await.unwrap();
        assert_eq!(first.relationships, 15);
        assert!(first.policies_seeded >= 6);
        assert!(first.triggers_seeded > 0);

        let second = office.init().await.unwrap();
        assert_eq!(second.policies_seeded, 0);
        assert_eq!(second.triggers_seeded, 0);
    }

    #[tokio::test]
    async fn missing_api_key_refuses_llm() {
        let office = office().await;
        let err = office.llm().err().unwrap();
        assert!(err.to_string().contains("LLM_API_KEY"));
    }

    #[tokio::test]
    async fn submitted_work_flows_through_the_executor() {
        let office = office().await;
        office.init().await.unwrap();
        let outcome = office
            .proposals
            .submit(ProposalInput::new(
                "chora",
                "Map incentives",
                vec![ProposedStep::new(StepKind::TraceIncentive, StepPayload::topic("pricing"))],
                ProposalSource::Manual,
            ))
            .await
            .unwrap();
        assert!(outcome.mission_id().is_some());

        let executor = office.step_executor(Arc::new(MockLlm::replying("{\"summary\": \"ok\"}")), "w");
        let report = executor.run_next().await.unwrap().unwrap();
        assert_eq!(report.status, StepStatus::Succeeded);

        let status = office.status().await.unwrap();
        assert_eq!(status["missions"]["succeeded"], 1);
        assert_eq!(status["proposals"]["accepted"], 1);
        assert!(status["last_heartbeat"].is_null());
    }
}
