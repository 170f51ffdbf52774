//! Personality drift derived from what an agent remembers. Rule-driven, no
//! model call, so the same memories always give the same modifiers.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::store::types::{MemoryQuery, MemoryRecord, MemoryType};
use crate::core::store::{MEMORY_CAP_PER_AGENT, MIN_MEMORY_CONFIDENCE, OfficeStore};

const VOICE_TTL: Duration = Duration::from_secs(10 * 60);
const MIN_MEMORIES: usize = 5;
const MAX_MODIFIERS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq)]
struct VoiceStats {
    total: usize,
    by_type: HashMap<MemoryType, usize>,
    /// Tags by descending frequency, with their counts.
    tags: Vec<(String, usize)>,
    avg_confidence: f64,
}

impl VoiceStats {
    fn from_memories(memories: &[MemoryRecord]) -> Self {
        let mut by_type = HashMap::new();
        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        let mut confidence = 0.0;
        for memory in memories {
            *by_type.entry(memory.memory_type).or_insert(0) += 1;
            confidence += memory.confidence;
            for tag in &memory.tags {
                if tag != "conversation" {
                    *tag_counts.entry(tag.as_str()).or_insert(0) += 1;
                }
            }
        }
        let mut tags: Vec<(String, usize)> = tag_counts
            .into_iter()
            .map(|(tag, n)| (tag.to_string(), n))
            .collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Self {
            total: memories.len(),
            by_type,
            tags,
            avg_confidence: if memories.is_empty() {
                0.0
            } else {
                confidence / memories.len() as f64
            },
        }
    }

    fn count(&self, memory_type: MemoryType) -> usize {
        self.by_type.get(&memory_type).copied().unwrap_or(0)
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|(t, _)| t == tag)
    }

    fn top_tag(&self) -> Option<(&str, usize)> {
        self.tags.first().map(|(t, n)| (t.as_str(), *n))
    }
}

/// Turn memory statistics into at most three prompt directives.
pub fn derive_modifiers(memories: &[MemoryRecord]) -> Vec<String> {
    let stats = VoiceStats::from_memories(memories);
    if stats.total < MIN_MEMORIES {
        return Vec::new();
    }

    let mut modifiers: Vec<String> = Vec::new();
    let lessons = stats.count(MemoryType::Lesson);
    let patterns = stats.count(MemoryType::Pattern);

    if lessons > 10 && stats.has_tag("engagement") {
        modifiers.push("Reference what works in engagement when relevant".into());
    }
    if patterns > 5 && stats.top_tag().map(|(t, _)| t) == Some("content") {
        modifiers.push("You've developed expertise in content strategy".into());
    }
    if stats.count(MemoryType::Strategy) > 8 {
        modifiers.push("You think strategically about long-term plans".into());
    }
    if stats.count(MemoryType::Insight) > 10 && stats.has_tag("analytics") {
        modifiers.push("Lead with data and numbers when making points".into());
    }
    if patterns > 8 {
        modifiers.push("You naturally spot patterns, mention them".into());
    }
    if lessons > 15 {
        modifiers.push("Draw on past lessons learned when advising others".into());
    }
    if stats.avg_confidence > 0.8 && stats.total > 20 {
        modifiers.push("Speak with authority, your track record is strong".into());
    }
    if let Some((tag, count)) = stats.top_tag()
        && count > 10
        && !modifiers.iter().any(|m| m.contains(tag))
    {
        modifiers.push(format!(
            "You have deep experience with {} and weave it in naturally",
            tag
        ));
    }
    if stats.count(MemoryType::Preference) > 5 {
        modifiers.push("You have strong opinions, express them confidently".into());
    }

    modifiers.truncate(MAX_MODIFIERS);
    modifiers
}

/// Per-agent voice modifiers with a ten minute cache.
pub struct VoiceEvolution {
    store: OfficeStore,
    cache: Mutex<HashMap<String, (Vec<String>, Instant)>>,
    ttl: Duration,
}

impl VoiceEvolution {
    pub fn new(store: OfficeStore) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            ttl: VOICE_TTL,
        }
    }

    pub async fn modifiers(&self, agent_id: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.cached(agent_id) {
            return Ok(cached);
        }
        let memories = self
            .store
            .query_memories(&MemoryQuery {
                agent_id: agent_id.to_string(),
                min_confidence: Some(MIN_MEMORY_CONFIDENCE),
                limit: MEMORY_CAP_PER_AGENT as usize,
                ..Default::default()
            })
            .await?;
        let modifiers = derive_modifiers(&memories);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), (modifiers.clone(), Instant::now() + self.ttl));
        Ok(modifiers)
    }

    fn cached(&self, agent_id: &str) -> Option<Vec<String>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(agent_id) {
            Some((modifiers, expires)) if Instant::now() < *expires => Some(modifiers.clone()),
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::NewMemory;

    fn memory(memory_type: MemoryType, confidence: f64, tags: &[&str]) -> MemoryRecord {
        MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: "chora".into(),
            memory_type,
            content: "x".into(),
            confidence,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source_trace_id: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn too_few_memories_means_no_modifiers() {
        let few: Vec<_> = (0..4).map(|_| memory(MemoryType::Strategy, 0.9, &[])).collect();
        assert!(derive_modifiers(&few).is_empty());
    }

    #[test]
    fn strategist_and_topic_specialist() {
        let memories: Vec<_> = (0..12)
            .map(|_| memory(MemoryType::Strategy, 0.7, &["pricing", "conversation"]))
            .collect();
        let modifiers = derive_modifiers(&memories);
        assert_eq!(
            modifiers,
            vec![
                "You think strategically about long-term plans".to_string(),
                "You have deep experience with pricing and weave it in naturally".to_string(),
            ]
        );
    }

    #[test]
    fn at_most_three_are_kept() {
        let mut memories: Vec<_> = (0..16)
            .map(|_| memory(MemoryType::Lesson, 0.9, &["engagement"]))
            .collect();
        memories.extend((0..9).map(|_| memory(MemoryType::Pattern, 0.9, &[])));
        memories.extend((0..6).map(|_| memory(MemoryType::Preference, 0.9, &[])));
        let modifiers = derive_modifiers(&memories);
        assert_eq!(modifiers.len(), 3);
        assert_eq!(modifiers[0], "Reference what works in engagement when relevant");
    }

    #[tokio::test]
    async fn cache_holds_until_cleared() {
        let store = test_store().await;
        let voices = VoiceEvolution::new(store.clone());
        assert!(voices.modifiers("praxis").await.unwrap().is_empty());

        for n in 0..10 {
            store
                .write_memory(&NewMemory {
                    agent_id: "praxis".into(),
                    memory_type: MemoryType::Strategy,
                    content: format!("plan {}", n),
                    confidence: Some(0.8),
                    tags: vec!["ops".into()],
                    source_trace_id: None,
                })
                .await
                .unwrap();
        }
        assert!(voices.modifiers("praxis").await.unwrap().is_empty());
        voices.clear();
        assert_eq!(
            voices.modifiers("praxis").await.unwrap(),
            vec!["You think strategically about long-term plans".to_string()]
        );
    }
}
