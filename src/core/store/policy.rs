use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{OfficeStore, now_ts};

impl OfficeStore {
    pub async fn get_policy_value(&self, key: &str) -> Result<Option<Value>> {
        let db = self.db.lock().await;
        let raw: Option<String> = db
            .query_row(
                "SELECT value FROM policies WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_policy_value(&self, key: &str, value: &Value) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO policies (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now_ts()],
        )?;
        Ok(())
    }

    /// Write `value` only when the key is absent. Returns true when it was written.
    pub async fn seed_policy_value(&self, key: &str, value: &Value) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO policies (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, serde_json::to_string(value)?, now_ts()],
        )?;
        Ok(rows > 0)
    }

    pub async fn list_policy_keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT key FROM policies ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
