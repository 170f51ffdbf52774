use anyhow::Result;
use std::collections::HashMap;
use tracing::info;

use super::chance::Chance;
use crate::core::store::OfficeStore;
use crate::core::store::types::{MemoryQuery, MemoryRecord, MemoryType};

const ENRICHMENT_PROBABILITY: f64 = 0.3;
const CACHE_FETCH: usize = 50;

/// Per-tick memory cache. Each agent is fetched once, broadly, and filtered in memory.
pub struct MemoryCache<'a> {
    store: &'a OfficeStore,
    min_confidence: f64,
    by_agent: HashMap<String, Vec<MemoryRecord>>,
}

impl<'a> MemoryCache<'a> {
    pub fn new(store: &'a OfficeStore, min_confidence: f64) -> Self {
        Self {
            store,
            min_confidence,
            by_agent: HashMap::new(),
        }
    }

    pub async fn memories(
        &mut self,
        agent_id: &str,
        types: &[MemoryType],
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        if !self.by_agent.contains_key(agent_id) {
            let fetched = self
                .store
                .query_memories(&MemoryQuery {
                    agent_id: agent_id.to_string(),
                    min_confidence: Some(self.min_confidence),
                    limit: CACHE_FETCH,
                    ..Default::default()
                })
                .await?;
            self.by_agent.insert(agent_id.to_string(), fetched);
        }
        Ok(self
            .by_agent
            .get(agent_id)
            .map(|all| {
                all.iter()
                    .filter(|m| types.is_empty() || types.contains(&m.memory_type))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub topic: String,
    pub memory_influenced: bool,
    pub memory_id: Option<String>,
}

impl Enrichment {
    fn unchanged(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            memory_influenced: false,
            memory_id: None,
        }
    }
}

/// Sometimes swap `base` for another candidate topic that the agent's strategy
/// or lesson memories point at, by keyword or tag overlap.
pub async fn enrich_topic(
    cache: &mut MemoryCache<'_>,
    chance: &Chance,
    agent_id: &str,
    base: &str,
    candidates: &[String],
) -> Result<Enrichment> {
    if !chance.chance(ENRICHMENT_PROBABILITY) {
        return Ok(Enrichment::unchanged(base));
    }
    let memories = cache
        .memories(agent_id, &[MemoryType::Strategy, MemoryType::Lesson], 10)
        .await?;
    Ok(pick_by_memory(&memories, agent_id, base, candidates).unwrap_or_else(|| Enrichment::unchanged(base)))
}

fn pick_by_memory(
    memories: &[MemoryRecord],
    agent_id: &str,
    base: &str,
    candidates: &[String],
) -> Option<Enrichment> {
    let others: Vec<&String> = candidates.iter().filter(|c| c.as_str() != base).collect();
    for memory in memories {
        let content = memory.content.to_lowercase();
        let keyword_hit = others.iter().find(|candidate| {
            candidate
                .to_lowercase()
                .split_whitespace()
                .any(|word| word.chars().count() > 3 && content.contains(word))
        });
        let tag_hit = || {
            memory.tags.iter().find_map(|tag| {
                let tag = tag.to_lowercase();
                others
                    .iter()
                    .find(|candidate| candidate.to_lowercase().contains(&tag))
            })
        };
        if let Some(candidate) = keyword_hit.or_else(tag_hit) {
            info!(
                "[Enrichment] {}: \"{}\" -> \"{}\" (memory {})",
                agent_id, base, candidate, memory.id
            );
            return Some(Enrichment {
                topic: candidate.to_string(),
                memory_influenced: true,
                memory_id: Some(memory.id.clone()),
            });
        }
    }
    None
}
