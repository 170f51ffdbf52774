use anyhow::Result;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;

use super::types::{MissionRecord, MissionStatus, StepRecord, StepStatus, StepTally};
use super::{OfficeStore, json_column, now_ts};
use crate::core::ops::steps::StepKind;

const MISSION_COLUMNS: &str = "id, proposal_id, title, description, status, created_by, \
     failure_reason, created_at, started_at, completed_at";

const STEP_COLUMNS: &str = "id, mission_id, seq, kind, status, payload, result, reserved_by, \
     failure_reason, created_at, started_at, completed_at, updated_at";

fn mission_from_row(row: &Row<'_>) -> rusqlite::Result<MissionRecord> {
    Ok(MissionRecord {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        created_by: row.get(5)?,
        failure_reason: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    let result: Option<String> = row.get(6)?;
    Ok(StepRecord {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        seq: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        payload: json_column(5, row.get(5)?)?,
        result: result.map(|raw| json_column(6, raw)).transpose()?,
        reserved_by: row.get(7)?,
        failure_reason: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl OfficeStore {
    /// Atomically reserve the oldest queued step whose mission is live and has no
    /// sibling already running. The owning mission moves to `running` in the same
    /// transaction. Returns `None` when nothing is claimable.
    pub async fn claim_next_step(&self, worker_id: &str) -> Result<Option<StepRecord>> {
        let now = now_ts();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "UPDATE mission_steps SET status = 'running', reserved_by = ?1, started_at = ?2, \
             updated_at = ?2 \
             WHERE id = ( \
                 SELECT s.id FROM mission_steps s JOIN missions m ON m.id = s.mission_id \
                 WHERE s.status = 'queued' AND m.status IN ('approved', 'running') \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM mission_steps r \
                       WHERE r.mission_id = s.mission_id AND r.status = 'running') \
                 ORDER BY s.created_at ASC, s.seq ASC LIMIT 1) \
             AND status = 'queued' \
             RETURNING {}",
            STEP_COLUMNS
        );
        let claimed = tx
            .query_row(&sql, params![worker_id, now], step_from_row)
            .optional()?;

        if let Some(step) = &claimed {
            tx.execute(
                "UPDATE missions SET status = ?1, started_at = COALESCE(started_at, ?2), \
                 updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    MissionStatus::Running,
                    now,
                    step.mission_id,
                    MissionStatus::Approved
                ],
            )?;
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub async fn get_mission(&self, id: &str) -> Result<Option<MissionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM missions WHERE id = ?1", MISSION_COLUMNS);
        Ok(db.query_row(&sql, params![id], mission_from_row).optional()?)
    }

    pub async fn get_step(&self, id: &str) -> Result<Option<StepRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM mission_steps WHERE id = ?1", STEP_COLUMNS);
        Ok(db.query_row(&sql, params![id], step_from_row).optional()?)
    }

    pub async fn list_missions(&self, limit: usize) -> Result<Vec<MissionRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM missions ORDER BY created_at DESC LIMIT ?1",
            MISSION_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], mission_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Most recent succeeded steps of the same mission, newest first.
    pub async fn recent_succeeded_siblings(
        &self,
        mission_id: &str,
        exclude_step: &str,
        limit: usize,
    ) -> Result<Vec<StepRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM mission_steps \
             WHERE mission_id = ?1 AND id != ?2 AND status = 'succeeded' \
             ORDER BY completed_at DESC LIMIT ?3",
            STEP_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![mission_id, exclude_step, limit as i64], step_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Mark a running step succeeded. Returns false if it was no longer running.
    pub async fn complete_step(&self, id: &str, result: &Value) -> Result<bool> {
        let now = now_ts();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE mission_steps SET status = ?1, result = ?2, completed_at = ?3, updated_at = ?3 \
             WHERE id = ?4 AND status = ?5",
            params![
                StepStatus::Succeeded,
                serde_json::to_string(result)?,
                now,
                id,
                StepStatus::Running
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn fail_step(&self, id: &str, reason: &str) -> Result<bool> {
        let now = now_ts();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE mission_steps SET status = ?1, failure_reason = ?2, completed_at = ?3, \
             updated_at = ?3 WHERE id = ?4 AND status = ?5",
            params![StepStatus::Failed, reason, now, id, StepStatus::Running],
        )?;
        Ok(rows > 0)
    }

    pub async fn step_tally(&self, mission_id: &str) -> Result<StepTally> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT status, COUNT(*) FROM mission_steps WHERE mission_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![mission_id], |row| {
            Ok((row.get::<_, StepStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut tally = StepTally::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                StepStatus::Queued => tally.queued = count,
                StepStatus::Running => tally.running = count,
                StepStatus::Succeeded => tally.succeeded = count,
                StepStatus::Failed => tally.failed = count,
            }
        }
        Ok(tally)
    }

    /// Move a live mission to a terminal status. Returns false when it was already terminal.
    pub async fn finalize_mission(
        &self,
        id: &str,
        status: MissionStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let now = now_ts();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE missions SET status = ?1, failure_reason = ?2, completed_at = ?3, \
             updated_at = ?3 WHERE id = ?4 AND status IN ('approved', 'running')",
            params![status, failure_reason, now, id],
        )?;
        Ok(rows > 0)
    }

    /// Fail every step that has been running since before `cutoff`.
    /// Returns `(step_id, mission_id)` for each recovered step.
    pub async fn recover_stale_steps(
        &self,
        cutoff: &str,
        reason: &str,
    ) -> Result<Vec<(String, String)>> {
        let now = now_ts();
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "UPDATE mission_steps SET status = 'failed', failure_reason = ?1, completed_at = ?2, \
             updated_at = ?2 WHERE status = 'running' AND updated_at < ?3 \
             RETURNING id, mission_id",
        )?;
        let rows = stmt.query_map(params![reason, now, cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_steps_since(
        &self,
        kinds: &[StepKind],
        statuses: &[StepStatus],
        since: &str,
    ) -> Result<i64> {
        if kinds.is_empty() || statuses.is_empty() {
            return Ok(0);
        }
        let kind_list = quoted_list(kinds.iter().map(|k| k.as_str()));
        let status_list = quoted_list(statuses.iter().map(|s| s.as_str()));
        let sql = format!(
            "SELECT COUNT(*) FROM mission_steps WHERE kind IN ({}) AND status IN ({}) \
             AND created_at >= ?1",
            kind_list, status_list
        );
        let db = self.db.lock().await;
        Ok(db.query_row(&sql, params![since], |row| row.get(0))?)
    }

    pub async fn count_missions_created_since(&self, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM missions WHERE created_at >= ?1",
            params![since],
            |row| row.get(0),
        )?)
    }

    /// Failed missions last touched at or after `since`, newest first.
    pub async fn failed_missions_since(
        &self,
        since: &str,
        limit: usize,
    ) -> Result<Vec<MissionRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM missions WHERE status = 'failed' AND updated_at >= ?1 \
             ORDER BY updated_at DESC LIMIT ?2",
            MISSION_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![since, limit as i64], mission_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Missions that reached a terminal status at or after `since`, newest first.
    pub async fn missions_finished_since(
        &self,
        since: &str,
        limit: usize,
    ) -> Result<Vec<MissionRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM missions WHERE status IN ('succeeded', 'failed') \
             AND completed_at >= ?1 ORDER BY completed_at DESC LIMIT ?2",
            MISSION_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![since, limit as i64], mission_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Steps of one kind that succeeded at or after `since`, joined with the mission owner.
    pub async fn succeeded_steps_of_kind_since(
        &self,
        kind: StepKind,
        since: &str,
    ) -> Result<Vec<(StepRecord, String)>> {
        let db = self.db.lock().await;
        let columns = STEP_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {}, m.created_by FROM mission_steps s JOIN missions m ON m.id = s.mission_id \
             WHERE s.kind = ?1 AND s.status = 'succeeded' AND s.completed_at >= ?2 \
             ORDER BY s.completed_at DESC",
            columns
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![kind, since], |row| {
            Ok((step_from_row(row)?, row.get(13)?))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    #[cfg(test)]
    pub(crate) async fn set_step_updated_at(&self, id: &str, at: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE mission_steps SET updated_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }
}

/// Enum text is a closed set of identifiers, so it is safe to inline.
fn quoted_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items
        .map(|item| format!("'{}'", item))
        .collect::<Vec<_>>()
        .join(", ")
}
