use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{EventRecord, NewEvent};
use super::{OfficeStore, json_column, new_id, now_ts};

const EVENT_COLUMNS: &str = "id, agent_id, kind, title, summary, tags, metadata, created_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        summary: row.get(4)?,
        tags: json_column(5, row.get(5)?)?,
        metadata: json_column(6, row.get(6)?)?,
        created_at: row.get(7)?,
    })
}

impl OfficeStore {
    pub async fn insert_event(&self, event: &NewEvent) -> Result<EventRecord> {
        let record = EventRecord {
            id: new_id(),
            agent_id: event.agent_id.clone(),
            kind: event.kind.clone(),
            title: event.title.clone(),
            summary: event.summary.clone(),
            tags: event.tags.clone(),
            metadata: event.metadata.clone(),
            created_at: now_ts(),
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO events (id, agent_id, kind, title, summary, tags, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.agent_id,
                record.kind,
                record.title,
                record.summary,
                serde_json::to_string(&record.tags)?,
                serde_json::to_string(&record.metadata)?,
                record.created_at
            ],
        )?;
        Ok(record)
    }

    /// Events of one kind created at or after `since`, newest first.
    pub async fn events_of_kind_since(
        &self,
        kind: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM events WHERE kind = ?1 AND created_at >= ?2 \
             ORDER BY created_at DESC LIMIT ?3",
            EVENT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![kind, since, limit as i64], event_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_events_since(&self, kind: &str, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM events WHERE kind = ?1 AND created_at >= ?2",
            params![kind, since],
            |row| row.get(0),
        )?)
    }

    pub async fn count_all_events_since(&self, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM events WHERE created_at >= ?1",
            params![since],
            |row| row.get(0),
        )?)
    }

    pub async fn list_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM events ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            EVENT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], event_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
