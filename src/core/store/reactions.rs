use anyhow::Result;
use rusqlite::{Row, TransactionBehavior, params};
use serde_json::Value;

use super::types::{ReactionPayload, ReactionRecord, ReactionStatus};
use super::{OfficeStore, json_column, new_id, now_ts};

const REACTION_COLUMNS: &str =
    "id, source_event_id, source_agent, target_agent, reaction_type, status, payload, created_at";

fn reaction_from_row(row: &Row<'_>) -> rusqlite::Result<ReactionRecord> {
    Ok(ReactionRecord {
        id: row.get(0)?,
        source_event_id: row.get(1)?,
        source_agent: row.get(2)?,
        target_agent: row.get(3)?,
        reaction_type: row.get(4)?,
        status: row.get(5)?,
        payload: json_column(6, row.get(6)?)?,
        created_at: row.get(7)?,
    })
}

impl OfficeStore {
    pub async fn insert_reaction(
        &self,
        source_event_id: &str,
        source_agent: &str,
        target_agent: &str,
        reaction_type: &str,
        payload: &ReactionPayload,
    ) -> Result<String> {
        let id = new_id();
        let now = now_ts();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO reactions (id, source_event_id, source_agent, target_agent, reaction_type, \
             status, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                source_event_id,
                source_agent,
                target_agent,
                reaction_type,
                ReactionStatus::Queued,
                serde_json::to_string(payload)?,
                now
            ],
        )?;
        Ok(id)
    }

    /// Whether `target` already has a reaction of this type queued since `since`.
    pub async fn recent_reaction_exists(
        &self,
        target_agent: &str,
        reaction_type: &str,
        since: &str,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM reactions WHERE target_agent = ?1 AND reaction_type = ?2 \
             AND created_at >= ?3",
            params![target_agent, reaction_type, since],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Move up to `limit` queued reactions to `processing`, oldest first.
    pub async fn claim_reactions(&self, limit: usize) -> Result<Vec<ReactionRecord>> {
        let now = now_ts();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut claimed = Vec::new();
        {
            let sql = format!(
                "UPDATE reactions SET status = 'processing', updated_at = ?1 \
                 WHERE id IN (SELECT id FROM reactions WHERE status = 'queued' \
                              ORDER BY created_at ASC LIMIT ?2) \
                 AND status = 'queued' RETURNING {}",
                REACTION_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![now, limit as i64], reaction_from_row)?;
            for row in rows {
                claimed.push(row?);
            }
        }
        tx.commit()?;
        // RETURNING order is unspecified
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    pub async fn finish_reaction(
        &self,
        id: &str,
        status: ReactionStatus,
        result: &Value,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE reactions SET status = ?1, result = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'processing'",
            params![status, serde_json::to_string(result)?, now_ts(), id],
        )?;
        Ok(rows > 0)
    }

    /// Return reactions stuck in `processing` since before `cutoff` to the queue.
    pub async fn requeue_stale_reactions(&self, cutoff: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE reactions SET status = 'queued', updated_at = ?1 \
             WHERE status = 'processing' AND updated_at < ?2",
            params![now_ts(), cutoff],
        )?;
        Ok(rows)
    }

    pub async fn count_reactions(&self, status: ReactionStatus) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM reactions WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?)
    }

    #[cfg(test)]
    pub(crate) async fn set_reaction_updated_at(&self, id: &str, at: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE reactions SET updated_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }
}
