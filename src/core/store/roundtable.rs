use anyhow::Result;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;

use super::types::{NewSession, SessionRecord, SessionStatus, TurnRecord};
use super::{OfficeStore, json_column, new_id, now_ts};

const SESSION_COLUMNS: &str = "id, format, topic, participants, status, turn_count, schedule_slot, \
     scheduled_for, metadata, created_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        format: row.get(1)?,
        topic: row.get(2)?,
        participants: json_column(3, row.get(3)?)?,
        status: row.get(4)?,
        turn_count: row.get(5)?,
        schedule_slot: row.get(6)?,
        scheduled_for: row.get(7)?,
        metadata: json_column(8, row.get(8)?)?,
        created_at: row.get(9)?,
    })
}

impl OfficeStore {
    pub async fn insert_session(&self, session: &NewSession) -> Result<String> {
        let id = new_id();
        let now = now_ts();
        let scheduled_for = session.scheduled_for.clone().unwrap_or_else(|| now.clone());
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO roundtable_sessions (id, format, topic, participants, status, turn_count, \
             schedule_slot, scheduled_for, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9)",
            params![
                id,
                session.format,
                session.topic,
                serde_json::to_string(&session.participants)?,
                SessionStatus::Pending,
                session.schedule_slot,
                scheduled_for,
                serde_json::to_string(&session.metadata)?,
                now
            ],
        )?;
        Ok(id)
    }

    /// Claim the oldest pending session that is due.
    pub async fn claim_session(&self, now: &str) -> Result<Option<SessionRecord>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "UPDATE roundtable_sessions SET status = 'running', started_at = ?1 \
             WHERE id = (SELECT id FROM roundtable_sessions \
                         WHERE status = 'pending' AND scheduled_for <= ?1 \
                         ORDER BY scheduled_for ASC, created_at ASC LIMIT 1) \
             AND status = 'pending' RETURNING {}",
            SESSION_COLUMNS
        );
        let claimed = tx.query_row(&sql, params![now], session_from_row).optional()?;
        tx.commit()?;
        Ok(claimed)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM roundtable_sessions WHERE id = ?1", SESSION_COLUMNS);
        Ok(db.query_row(&sql, params![id], session_from_row).optional()?)
    }

    pub async fn insert_turn(&self, turn: &TurnRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO roundtable_turns (session_id, turn_number, speaker, dialogue, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![turn.session_id, turn.turn_number, turn.speaker, turn.dialogue, now_ts()],
        )?;
        db.execute(
            "UPDATE roundtable_sessions SET turn_count = ?1 WHERE id = ?2",
            params![turn.turn_number + 1, turn.session_id],
        )?;
        Ok(())
    }

    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<TurnRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id, turn_number, speaker, dialogue FROM roundtable_turns \
             WHERE session_id = ?1 ORDER BY turn_number ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(TurnRecord {
                session_id: row.get(0)?,
                turn_number: row.get(1)?,
                speaker: row.get(2)?,
                dialogue: row.get(3)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn complete_session(&self, id: &str, turn_count: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE roundtable_sessions SET status = ?1, turn_count = ?2, completed_at = ?3 \
             WHERE id = ?4 AND status = 'running'",
            params![SessionStatus::Completed, turn_count, now_ts(), id],
        )?;
        Ok(rows > 0)
    }

    /// Fail a running session, merging `metadata` into what it already carries.
    pub async fn fail_session(&self, id: &str, metadata: &Value) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE roundtable_sessions SET status = ?1, completed_at = ?2, \
             metadata = json_patch(metadata, ?3) WHERE id = ?4 AND status = 'running'",
            params![SessionStatus::Failed, now_ts(), serde_json::to_string(metadata)?, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn count_sessions_since(&self, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM roundtable_sessions WHERE created_at >= ?1",
            params![since],
            |row| row.get(0),
        )?)
    }

    pub async fn count_slot_sessions_since(&self, slot: &str, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM roundtable_sessions WHERE schedule_slot = ?1 AND created_at >= ?2",
            params![slot, since],
            |row| row.get(0),
        )?)
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM roundtable_sessions ORDER BY created_at DESC LIMIT ?1",
            SESSION_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], session_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
