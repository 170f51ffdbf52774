use anyhow::Result;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use rusqlite::types::Value as SqlValue;

use super::types::{MemoryQuery, MemoryRecord, MemoryStats, MemoryType, NewMemory};
use super::{OfficeStore, json_column, new_id, now_ts};

/// Writes below this confidence are dropped.
pub const MIN_MEMORY_CONFIDENCE: f64 = 0.55;
pub const DEFAULT_MEMORY_CONFIDENCE: f64 = 0.6;
/// Live memories kept per agent; the oldest are evicted past this.
pub const MEMORY_CAP_PER_AGENT: i64 = 200;

const MEMORY_COLUMNS: &str = "id, agent_id, type, content, confidence, tags, source_trace_id, created_at";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        memory_type: row.get(2)?,
        content: row.get(3)?,
        confidence: row.get(4)?,
        tags: json_column(5, row.get(5)?)?,
        source_trace_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl OfficeStore {
    /// Store a memory. Returns `None` when it was below the confidence floor or
    /// its trace id was already recorded.
    pub async fn write_memory(&self, memory: &NewMemory) -> Result<Option<String>> {
        let confidence = memory.confidence.unwrap_or(DEFAULT_MEMORY_CONFIDENCE);
        if confidence < MIN_MEMORY_CONFIDENCE {
            return Ok(None);
        }
        let confidence = confidence.min(1.0);

        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(trace) = &memory.source_trace_id {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM agent_memory WHERE source_trace_id = ?1",
                    params![trace],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }
        }

        let id = new_id();
        tx.execute(
            "INSERT INTO agent_memory (id, agent_id, type, content, confidence, tags, \
             source_trace_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                memory.agent_id,
                memory.memory_type,
                memory.content,
                confidence,
                serde_json::to_string(&memory.tags)?,
                memory.source_trace_id,
                now_ts()
            ],
        )?;

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM agent_memory WHERE agent_id = ?1 AND superseded_by IS NULL",
            params![memory.agent_id],
            |row| row.get(0),
        )?;
        if live > MEMORY_CAP_PER_AGENT {
            tx.execute(
                "DELETE FROM agent_memory WHERE id IN ( \
                     SELECT id FROM agent_memory WHERE agent_id = ?1 AND superseded_by IS NULL \
                     ORDER BY created_at ASC, rowid ASC LIMIT ?2)",
                params![memory.agent_id, live - MEMORY_CAP_PER_AGENT],
            )?;
        }
        tx.commit()?;
        Ok(Some(id))
    }

    /// Live memories matching the query, highest confidence first.
    pub async fn query_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM agent_memory WHERE agent_id = ? AND superseded_by IS NULL",
            MEMORY_COLUMNS
        );
        let mut args: Vec<SqlValue> = vec![SqlValue::Text(query.agent_id.clone())];

        if !query.types.is_empty() {
            let marks = vec!["?"; query.types.len()].join(", ");
            sql.push_str(&format!(" AND type IN ({})", marks));
            args.extend(query.types.iter().map(|t| SqlValue::Text(t.as_str().to_string())));
        }
        if let Some(min) = query.min_confidence {
            sql.push_str(" AND confidence >= ?");
            args.push(SqlValue::Real(min));
        }
        if !query.tags.is_empty() {
            let marks = vec!["?"; query.tags.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(agent_memory.tags) WHERE value IN ({}))",
                marks
            ));
            args.extend(query.tags.iter().cloned().map(SqlValue::Text));
        }
        sql.push_str(" ORDER BY confidence DESC, created_at DESC LIMIT ?");
        args.push(SqlValue::Integer(query.limit.max(1) as i64));

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), memory_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Memories an agent gained since `since` whose trace id starts with one of
    /// `trace_prefixes`. No prefixes counts every memory.
    pub async fn count_memories_since(
        &self,
        agent_id: &str,
        since: &str,
        trace_prefixes: &[&str],
    ) -> Result<i64> {
        let db = self.db.lock().await;
        if trace_prefixes.is_empty() {
            return Ok(db.query_row(
                "SELECT COUNT(*) FROM agent_memory WHERE agent_id = ?1 AND created_at >= ?2",
                params![agent_id, since],
                |row| row.get(0),
            )?);
        }
        let mut total = 0;
        for prefix in trace_prefixes {
            let count: i64 = db.query_row(
                "SELECT COUNT(*) FROM agent_memory WHERE agent_id = ?1 AND created_at >= ?2 \
                 AND source_trace_id LIKE ?3",
                params![agent_id, since, format!("{}%", prefix)],
                |row| row.get(0),
            )?;
            total += count;
        }
        Ok(total)
    }

    pub async fn memory_trace_exists(&self, trace: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let found: Option<i64> = db
            .query_row(
                "SELECT 1 FROM agent_memory WHERE source_trace_id = ?1",
                params![trace],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn memory_stats(&self, agent_id: &str) -> Result<MemoryStats> {
        let db = self.db.lock().await;
        let mut stats = MemoryStats::default();

        let mut stmt = db.prepare(
            "SELECT type, COUNT(*) FROM agent_memory WHERE agent_id = ?1 \
             AND superseded_by IS NULL GROUP BY type",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok((row.get::<_, MemoryType>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (memory_type, count) = row?;
            stats.total += count;
            stats.by_type.insert(memory_type, count);
        }

        stats.top_tag = db
            .query_row(
                "SELECT j.value, COUNT(*) AS n FROM agent_memory m, json_each(m.tags) j \
                 WHERE m.agent_id = ?1 AND m.superseded_by IS NULL \
                 GROUP BY j.value ORDER BY n DESC, j.value ASC LIMIT 1",
                params![agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    fn memory(agent: &str, content: &str, confidence: Option<f64>, trace: Option<&str>) -> NewMemory {
        NewMemory {
            agent_id: agent.to_string(),
            memory_type: MemoryType::Insight,
            content: content.to_string(),
            confidence,
            tags: vec!["ops".to_string()],
            source_trace_id: trace.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn low_confidence_and_duplicate_traces_are_dropped() {
        let store = test_store().await;
        assert!(store.write_memory(&memory("chora", "weak", Some(0.4), None)).await.unwrap().is_none());
        assert!(store.write_memory(&memory("chora", "a", None, Some("t1"))).await.unwrap().is_some());
        assert!(store.write_memory(&memory("chora", "b", Some(0.9), Some("t1"))).await.unwrap().is_none());

        let all = store
            .query_memories(&MemoryQuery {
                agent_id: "chora".into(),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].confidence, DEFAULT_MEMORY_CONFIDENCE);
        assert!(store.memory_trace_exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn cap_evicts_oldest() {
        let store = test_store().await;
        for n in 0..(MEMORY_CAP_PER_AGENT + 3) {
            store
                .write_memory(&memory("mux", &format!("m{}", n), Some(0.7), None))
                .await
                .unwrap();
        }
        let stats = store.memory_stats("mux").await.unwrap();
        assert_eq!(stats.total, MEMORY_CAP_PER_AGENT);
        assert_eq!(stats.top_tag, Some(("ops".to_string(), MEMORY_CAP_PER_AGENT)));

        let all = store
            .query_memories(&MemoryQuery {
                agent_id: "mux".into(),
                limit: 500,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(all.iter().all(|m| m.content != "m0" && m.content != "m2"));
    }

    #[tokio::test]
    async fn query_filters_by_type_tag_and_confidence() {
        let store = test_store().await;
        let mut lesson = memory("thaum", "lesson", Some(0.8), None);
        lesson.memory_type = MemoryType::Lesson;
        lesson.tags = vec!["shipping".into()];
        store.write_memory(&lesson).await.unwrap();
        store.write_memory(&memory("thaum", "insight", Some(0.6), None)).await.unwrap();

        let found = store
            .query_memories(&MemoryQuery {
                agent_id: "thaum".into(),
                types: vec![MemoryType::Lesson, MemoryType::Pattern],
                tags: vec!["shipping".into()],
                min_confidence: Some(0.7),
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "lesson");

        let stats = store.memory_stats("thaum").await.unwrap();
        assert_eq!(stats.of_type(MemoryType::Lesson), 1);
        assert_eq!(stats.of_type(MemoryType::Strategy), 0);
    }

    #[tokio::test]
    async fn counts_by_trace_prefix() {
        let store = test_store().await;
        store
            .write_memory(&memory("chora", "x", Some(0.7), Some("mission-lesson:1")))
            .await
            .unwrap();
        store
            .write_memory(&memory("chora", "y", Some(0.7), Some("conversation:abc")))
            .await
            .unwrap();
        let since = super::super::today_start();
        let n = store
            .count_memories_since("chora", &since, &["mission-lesson:", "tweet-lesson:"])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.count_memories_since("chora", &since, &[]).await.unwrap(), 2);
    }
}
