use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::{OfficeStore, json_column, now_ts};

/// Audit row written once per heartbeat tick.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRun {
    pub action: String,
    pub status: String,
    pub result: Value,
    pub duration_ms: i64,
    pub created_at: String,
}

impl OfficeStore {
    pub async fn insert_action_run(
        &self,
        action: &str,
        status: &str,
        result: &Value,
        duration_ms: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO action_runs (action, status, result, duration_ms, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, status, serde_json::to_string(result)?, duration_ms, now_ts()],
        )?;
        Ok(())
    }

    pub async fn recent_action_runs(&self, limit: usize) -> Result<Vec<ActionRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT action, status, result, duration_ms, created_at FROM action_runs \
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ActionRun {
                action: row.get(0)?,
                status: row.get(1)?,
                result: json_column(2, row.get(2)?)?,
                duration_ms: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

const STATUS_TABLES: &[(&str, &str)] = &[
    ("proposals", "proposals"),
    ("missions", "missions"),
    ("steps", "mission_steps"),
    ("sessions", "roundtable_sessions"),
    ("reactions", "reactions"),
    ("initiatives", "initiative_queue"),
];

impl OfficeStore {
    /// Row counts by status for every work table, e.g. `{"missions": {"running": 2}}`.
    pub async fn status_snapshot(&self) -> Result<Value> {
        let db = self.db.lock().await;
        let mut snapshot = Map::new();
        for (label, table) in STATUS_TABLES {
            let mut stmt =
                db.prepare(&format!("SELECT status, COUNT(*) FROM {} GROUP BY status", table))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = Map::new();
            for row in rows {
                let (status, count) = row?;
                counts.insert(status, json!(count));
            }
            snapshot.insert(label.to_string(), Value::Object(counts));
        }
        Ok(Value::Object(snapshot))
    }
}
