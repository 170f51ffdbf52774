use anyhow::Result;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use super::types::{DriftEntry, RelationshipRecord};
use super::{OfficeStore, json_column, now_ts};

pub const MIN_AFFINITY: f64 = 0.1;
pub const MAX_AFFINITY: f64 = 0.95;
pub const DEFAULT_AFFINITY: f64 = 0.5;
const DRIFT_LOG_LEN: usize = 20;

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<RelationshipRecord> {
    Ok(RelationshipRecord {
        agent_a: row.get(0)?,
        agent_b: row.get(1)?,
        affinity: row.get(2)?,
        total_interactions: row.get(3)?,
        positive_interactions: row.get(4)?,
        negative_interactions: row.get(5)?,
        drift_log: json_column(6, row.get(6)?)?,
    })
}

/// Affinity after one drift, kept inside the allowed band.
pub fn drifted(current: f64, drift: f64) -> f64 {
    (current + drift).clamp(MIN_AFFINITY, MAX_AFFINITY)
}

/// Relationship rows are keyed by the lexically ordered pair.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

impl OfficeStore {
    pub async fn ensure_relationship(&self, a: &str, b: &str, affinity: f64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let (a, b) = ordered_pair(a, b);
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO agent_relationships (agent_a, agent_b, affinity, updated_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![a, b, affinity.clamp(MIN_AFFINITY, MAX_AFFINITY), now_ts()],
        )?;
        Ok(())
    }

    pub async fn get_relationship(&self, a: &str, b: &str) -> Result<Option<RelationshipRecord>> {
        let (a, b) = ordered_pair(a, b);
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT agent_a, agent_b, affinity, total_interactions, positive_interactions, \
                 negative_interactions, drift_log FROM agent_relationships \
                 WHERE agent_a = ?1 AND agent_b = ?2",
                params![a, b],
                relationship_from_row,
            )
            .optional()?)
    }

    /// Every relationship row touching any of `agents`.
    pub async fn load_relationships(&self, agents: &[String]) -> Result<Vec<RelationshipRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_a, agent_b, affinity, total_interactions, positive_interactions, \
             negative_interactions, drift_log FROM agent_relationships ORDER BY agent_a, agent_b",
        )?;
        let rows = stmt.query_map([], relationship_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            let rel = row?;
            if agents.is_empty() || agents.contains(&rel.agent_a) || agents.contains(&rel.agent_b) {
                results.push(rel);
            }
        }
        Ok(results)
    }

    /// Apply an affinity drift as one read-modify-write. The new value is clamped,
    /// interaction counters move with the sign of the drift and the log keeps the
    /// last entries only. Returns the resulting affinity.
    pub async fn apply_drift(
        &self,
        a: &str,
        b: &str,
        drift: f64,
        reason: &str,
        conversation_id: &str,
    ) -> Result<f64> {
        let (a, b) = ordered_pair(a, b);
        let now = now_ts();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO agent_relationships (agent_a, agent_b, affinity, updated_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![a, b, DEFAULT_AFFINITY, now],
        )?;
        let (current, raw_log): (f64, String) = tx.query_row(
            "SELECT affinity, drift_log FROM agent_relationships WHERE agent_a = ?1 AND agent_b = ?2",
            params![a, b],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut log: Vec<DriftEntry> = serde_json::from_str(&raw_log).unwrap_or_default();
        log.push(DriftEntry {
            drift,
            reason: reason.to_string(),
            conversation_id: conversation_id.to_string(),
            at: now.clone(),
        });
        if log.len() > DRIFT_LOG_LEN {
            log.drain(..log.len() - DRIFT_LOG_LEN);
        }

        let updated = drifted(current, drift);
        let positive = i64::from(drift > 0.0);
        let negative = i64::from(drift < 0.0);
        tx.execute(
            "UPDATE agent_relationships SET affinity = ?1, total_interactions = total_interactions + 1, \
             positive_interactions = positive_interactions + ?2, \
             negative_interactions = negative_interactions + ?3, drift_log = ?4, updated_at = ?5 \
             WHERE agent_a = ?6 AND agent_b = ?7",
            params![updated, positive, negative, serde_json::to_string(&log)?, now, a, b],
        )?;
        tx.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn affinity_stays_in_band(
            start in MIN_AFFINITY..=MAX_AFFINITY,
            drifts in proptest::collection::vec(-0.5f64..0.5, 0..60),
        ) {
            let end = drifts.iter().fold(start, |acc, d| drifted(acc, *d));
            prop_assert!((MIN_AFFINITY..=MAX_AFFINITY).contains(&end));
        }

        #[test]
        fn pair_is_always_ordered(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let (x, y) = ordered_pair(&a, &b);
            prop_assert!(x <= y);
        }
    }

    #[tokio::test]
    async fn pair_order_does_not_matter() {
        let store = test_store().await;
        store.ensure_relationship("thaum", "chora", 0.6).await.unwrap();
        let rel = store.get_relationship("chora", "thaum").await.unwrap().unwrap();
        assert_eq!(rel.agent_a, "chora");
        assert_eq!(rel.agent_b, "thaum");
        assert_eq!(rel.affinity, 0.6);
        assert!(store.get_relationship("thaum", "chora").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drift_clamps_and_trims_log() {
        let store = test_store().await;
        store.ensure_relationship("chora", "mux", 0.5).await.unwrap();
        let mut last = 0.0;
        for n in 0..25 {
            last = store
                .apply_drift("mux", "chora", -0.03, "friction", &format!("c{}", n))
                .await
                .unwrap();
        }
        assert_eq!(last, MIN_AFFINITY);
        let rel = store.get_relationship("chora", "mux").await.unwrap().unwrap();
        assert_eq!(rel.drift_log.len(), 20);
        assert_eq!(rel.drift_log[0].conversation_id, "c5");
        assert_eq!(rel.total_interactions, 25);
        assert_eq!(rel.negative_interactions, 25);
        assert_eq!(rel.positive_interactions, 0);
    }
}
