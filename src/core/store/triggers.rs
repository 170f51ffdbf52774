use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{NewTriggerRule, TriggerRuleRecord};
use super::{OfficeStore, json_column, new_id, now_ts};

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<TriggerRuleRecord> {
    Ok(TriggerRuleRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        trigger_event: row.get(2)?,
        conditions: json_column(3, row.get(3)?)?,
        action_config: json_column(4, row.get(4)?)?,
        cooldown_minutes: row.get(5)?,
        enabled: row.get(6)?,
        fire_count: row.get(7)?,
        last_fired_at: row.get(8)?,
    })
}

impl OfficeStore {
    /// Enabled rules, never-fired first, then oldest `last_fired_at` first.
    pub async fn list_enabled_triggers(&self) -> Result<Vec<TriggerRuleRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, trigger_event, conditions, action_config, cooldown_minutes, \
             enabled, fire_count, last_fired_at FROM trigger_rules WHERE enabled = 1 \
             ORDER BY last_fired_at IS NOT NULL, last_fired_at ASC, created_at ASC",
        )?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Insert a rule unless one with the same name exists. Returns true when inserted.
    pub async fn insert_trigger(&self, rule: &NewTriggerRule) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO trigger_rules (id, name, trigger_event, conditions, \
             action_config, cooldown_minutes, enabled, fire_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7)",
            params![
                new_id(),
                rule.name,
                rule.trigger_event,
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.action_config)?,
                rule.cooldown_minutes,
                now_ts()
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn mark_trigger_fired(&self, id: &str, at: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE trigger_rules SET fire_count = fire_count + 1, last_fired_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }

    pub async fn set_trigger_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE trigger_rules SET enabled = ?1 WHERE name = ?2",
            params![enabled, name],
        )?;
        Ok(rows > 0)
    }
}
