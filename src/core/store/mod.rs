mod events;
mod initiative;
mod memory;
mod missions;
mod policy;
mod proposals;
mod reactions;
mod relationships;
mod roundtable;
mod runs;
mod triggers;
pub mod types;

pub use memory::{DEFAULT_MEMORY_CONFIDENCE, MEMORY_CAP_PER_AGENT, MIN_MEMORY_CONFIDENCE};
pub use relationships::{DEFAULT_AFFINITY, MAX_AFFINITY, MIN_AFFINITY, ordered_pair};
pub use runs::ActionRun;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;

/// SQLite-backed store shared by every worker in the process. Other processes
/// coordinate through the same database file using conditional updates.
#[derive(Clone)]
pub struct OfficeStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS proposals (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        proposed_steps TEXT NOT NULL,
        status TEXT NOT NULL,
        source TEXT NOT NULL,
        source_trace_id TEXT,
        auto_approved INTEGER NOT NULL DEFAULT 0,
        rejection_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS missions (
        id TEXT PRIMARY KEY,
        proposal_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        failure_reason TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mission_steps (
        id TEXT PRIMARY KEY,
        mission_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        result TEXT,
        reserved_by TEXT,
        failure_reason TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        summary TEXT,
        tags TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS policies (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trigger_rules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        trigger_event TEXT NOT NULL,
        conditions TEXT NOT NULL,
        action_config TEXT NOT NULL,
        cooldown_minutes INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        fire_count INTEGER NOT NULL DEFAULT 0,
        last_fired_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS reactions (
        id TEXT PRIMARY KEY,
        source_event_id TEXT NOT NULL,
        source_agent TEXT NOT NULL,
        target_agent TEXT NOT NULL,
        reaction_type TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        result TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_memory (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        type TEXT NOT NULL,
        content TEXT NOT NULL,
        confidence REAL NOT NULL,
        tags TEXT NOT NULL,
        source_trace_id TEXT UNIQUE,
        superseded_by TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_relationships (
        agent_a TEXT NOT NULL,
        agent_b TEXT NOT NULL,
        affinity REAL NOT NULL,
        total_interactions INTEGER NOT NULL DEFAULT 0,
        positive_interactions INTEGER NOT NULL DEFAULT 0,
        negative_interactions INTEGER NOT NULL DEFAULT 0,
        drift_log TEXT NOT NULL DEFAULT '[]',
        updated_at TEXT NOT NULL,
        PRIMARY KEY (agent_a, agent_b),
        CHECK (agent_a < agent_b)
    )",
    "CREATE TABLE IF NOT EXISTS roundtable_sessions (
        id TEXT PRIMARY KEY,
        format TEXT NOT NULL,
        topic TEXT NOT NULL,
        participants TEXT NOT NULL,
        status TEXT NOT NULL,
        turn_count INTEGER NOT NULL DEFAULT 0,
        schedule_slot TEXT,
        scheduled_for TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS roundtable_turns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        turn_number INTEGER NOT NULL,
        speaker TEXT NOT NULL,
        dialogue TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (session_id, turn_number)
    )",
    "CREATE TABLE IF NOT EXISTS initiative_queue (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        context TEXT NOT NULL,
        result TEXT,
        created_at TEXT NOT NULL,
        processed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS action_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        status TEXT NOT NULL,
        result TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_proposals_agent_created ON proposals(agent_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_proposals_trace ON proposals(source_trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_steps_status_created ON mission_steps(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_steps_mission ON mission_steps(mission_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_events_kind_created ON events(kind, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_reactions_status_created ON reactions(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_memory_agent ON agent_memory(agent_id, superseded_by, confidence)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON roundtable_sessions(status, scheduled_for)",
];

impl OfficeStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir).await?;
        }
        let db_path = data_dir.join("office.db");
        let db = Connection::open(&db_path)?;
        Self::prepare(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
        })
    }

    fn prepare(db: &Connection) -> Result<()> {
        db.busy_timeout(Duration::from_secs(5))?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        for stmt in SCHEMA {
            db.execute(stmt, [])?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// A second handle on the same database file, as another worker process would have.
    #[cfg(test)]
    pub async fn reopen(&self) -> Result<Self> {
        let db = Connection::open(&self.db_path)?;
        Self::prepare(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: self.db_path.clone(),
        })
    }
}

/// Build a store in a throwaway directory for tests.
#[cfg(test)]
pub async fn test_store() -> OfficeStore {
    let tmpdir = std::env::temp_dir().join(format!("ops-office-test-{}", uuid::Uuid::new_v4()));
    OfficeStore::open(&tmpdir).await.expect("open test store")
}

/// Timestamps are stored as fixed-width RFC 3339 text so they compare lexically.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn minutes_ago(minutes: i64) -> String {
    ts(Utc::now() - chrono::Duration::minutes(minutes))
}

/// Start of the current UTC day.
pub fn today_start() -> String {
    let now = Utc::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    ts(midnight)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl LifecycleComponent for OfficeStore {
    async fn on_init(&mut self) -> Result<()> {
        info!("Office store ready at {}", self.db_path.display());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        info!("Office store checkpointed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_compare_lexically() {
        let earlier = ts(Utc::now() - chrono::Duration::minutes(5));
        let later = now_ts();
        assert!(earlier < later);
        assert!(today_start() <= later);
        assert!(later.ends_with('Z'));
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let store = test_store().await;
        let again = store.reopen().await.unwrap();
        assert_eq!(store.db_path(), again.db_path());
    }
}
