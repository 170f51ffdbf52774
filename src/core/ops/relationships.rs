use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

use super::chance::Chance;
use crate::core::agents::{ROSTER, SEED_AFFINITIES};
use crate::core::store::{DEFAULT_AFFINITY, OfficeStore, ordered_pair};

/// Largest drift a single conversation may apply to one pair.
pub const MAX_DRIFT_PER_CONVERSATION: f64 = 0.03;

/// Affinities loaded once per conversation, keyed by ordered pair.
#[derive(Debug, Clone, Default)]
pub struct AffinityMap {
    pairs: HashMap<(String, String), f64>,
}

impl AffinityMap {
    pub async fn load(store: &OfficeStore, participants: &[String]) -> Result<Self> {
        let mut map = Self::default();
        for rel in store.load_relationships(participants).await? {
            map.pairs.insert((rel.agent_a, rel.agent_b), rel.affinity);
        }
        Ok(map)
    }

    pub fn set(&mut self, a: &str, b: &str, affinity: f64) {
        let (a, b) = ordered_pair(a, b);
        self.pairs.insert((a.to_string(), b.to_string()), affinity);
    }

    /// An agent is fully aligned with itself; unknown pairs sit at the default.
    pub fn get(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let (a, b) = ordered_pair(a, b);
        self.pairs
            .get(&(a.to_string(), b.to_string()))
            .copied()
            .unwrap_or(DEFAULT_AFFINITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionTone {
    Supportive,
    Agreement,
    Neutral,
    Critical,
    Challenge,
}

impl InteractionTone {
    /// Tone a speaker takes toward the previous speaker, from their tension (`1 - affinity`).
    pub fn for_affinity(affinity: f64, chance: &Chance) -> Self {
        let tension = 1.0 - affinity;
        if tension > 0.6 {
            if chance.chance(0.2) {
                InteractionTone::Challenge
            } else {
                InteractionTone::Critical
            }
        } else if tension > 0.3 {
            InteractionTone::Neutral
        } else if chance.chance(0.4) {
            InteractionTone::Supportive
        } else {
            InteractionTone::Agreement
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InteractionTone::Supportive => "supportive",
            InteractionTone::Agreement => "agreement",
            InteractionTone::Neutral => "neutral",
            InteractionTone::Critical => "critical",
            InteractionTone::Challenge => "challenge",
        }
    }

    pub fn guide(self) -> &'static str {
        match self {
            InteractionTone::Supportive => "Be encouraging and build on what was said",
            InteractionTone::Agreement => "Show alignment while adding your perspective",
            InteractionTone::Neutral => "Respond naturally without strong bias",
            InteractionTone::Critical => "Push back constructively, ask tough questions",
            InteractionTone::Challenge => "Directly challenge the last point made, be bold",
        }
    }
}

/// Create a relationship row for every roster pair. Existing rows keep their affinity.
pub async fn seed_relationships(store: &OfficeStore) -> Result<usize> {
    let mut seeded = 0;
    for (i, a) in ROSTER.iter().enumerate() {
        for b in &ROSTER[i + 1..] {
            let affinity = SEED_AFFINITIES
                .iter()
                .find(|(x, y, _)| ordered_pair(x, y) == ordered_pair(a.id, b.id))
                .map(|(_, _, affinity)| *affinity)
                .unwrap_or(DEFAULT_AFFINITY);
            store.ensure_relationship(a.id, b.id, affinity).await?;
            seeded += 1;
        }
    }
    info!("[Relationships] Ensured {} agent pair(s)", seeded);
    Ok(seeded)
}
