use anyhow::Result;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use super::types::{
    MissionStatus, NewProposal, ProposalRecord, ProposalStatus, ProposedStep, StepStatus,
};
use super::{OfficeStore, json_column, new_id, now_ts};

const PROPOSAL_COLUMNS: &str = "id, agent_id, title, description, proposed_steps, status, source, \
     source_trace_id, auto_approved, rejection_reason, created_at";

fn proposal_from_row(row: &Row<'_>) -> rusqlite::Result<ProposalRecord> {
    Ok(ProposalRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        proposed_steps: json_column(4, row.get(4)?)?,
        status: row.get(5)?,
        source: row.get(6)?,
        source_trace_id: row.get(7)?,
        auto_approved: row.get(8)?,
        rejection_reason: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl OfficeStore {
    pub async fn count_proposals_since(&self, agent_id: &str, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM proposals WHERE agent_id = ?1 AND created_at >= ?2",
            params![agent_id, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn insert_proposal(
        &self,
        proposal: &NewProposal<'_>,
        status: ProposalStatus,
        rejection_reason: Option<&str>,
    ) -> Result<String> {
        let id = new_id();
        let now = now_ts();
        let steps = serde_json::to_string(proposal.steps)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO proposals (id, agent_id, title, description, proposed_steps, status, source, \
             source_trace_id, auto_approved, rejection_reason, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10)",
            params![
                id,
                proposal.agent_id,
                proposal.title,
                proposal.description,
                steps,
                status,
                proposal.source,
                proposal.source_trace_id,
                rejection_reason,
                now
            ],
        )?;
        Ok(id)
    }

    /// Accept a pending proposal and materialize its mission with queued steps.
    /// Returns `None` when the proposal was no longer pending.
    pub async fn accept_proposal_with_mission(
        &self,
        proposal_id: &str,
        created_by: &str,
        title: &str,
        description: Option<&str>,
        steps: &[ProposedStep],
    ) -> Result<Option<String>> {
        let now = now_ts();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let accepted = tx.execute(
            "UPDATE proposals SET status = ?1, auto_approved = 1, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![ProposalStatus::Accepted, now, proposal_id, ProposalStatus::Pending],
        )?;
        if accepted == 0 {
            return Ok(None);
        }

        let mission_id = new_id();
        tx.execute(
            "INSERT INTO missions (id, proposal_id, title, description, status, created_by, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                mission_id,
                proposal_id,
                title,
                description,
                MissionStatus::Approved,
                created_by,
                now
            ],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO mission_steps (id, mission_id, seq, kind, status, payload, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            )?;
            for (seq, step) in steps.iter().enumerate() {
                insert.execute(params![
                    new_id(),
                    mission_id,
                    seq as i64,
                    step.kind,
                    StepStatus::Queued,
                    serde_json::to_string(&step.payload)?,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(Some(mission_id))
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Option<ProposalRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM proposals WHERE id = ?1", PROPOSAL_COLUMNS);
        let record = db
            .query_row(&sql, params![id], proposal_from_row)
            .optional()?;
        Ok(record)
    }

    /// Earliest proposal filed under `trace`, with the mission it produced if any.
    pub async fn proposal_for_trace(
        &self,
        trace: &str,
    ) -> Result<Option<(ProposalRecord, Option<String>)>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM proposals WHERE source_trace_id = ?1 ORDER BY created_at ASC LIMIT 1",
            PROPOSAL_COLUMNS
        );
        let Some(record) = db
            .query_row(&sql, params![trace], proposal_from_row)
            .optional()?
        else {
            return Ok(None);
        };
        let mission_id = db
            .query_row(
                "SELECT id FROM missions WHERE proposal_id = ?1",
                params![record.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Some((record, mission_id)))
    }

    pub async fn list_proposals(&self, limit: usize) -> Result<Vec<ProposalRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM proposals ORDER BY created_at DESC LIMIT ?1",
            PROPOSAL_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], proposal_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::super::types::{ProposalSource, StepPayload};
    use super::*;
    use crate::core::ops::steps::StepKind;

    fn steps() -> Vec<ProposedStep> {
        vec![
            ProposedStep::new(StepKind::ScanSignals, StepPayload::topic("AI trends")),
            ProposedStep::new(StepKind::DraftThread, StepPayload::default()),
        ]
    }

    #[tokio::test]
    async fn accepting_creates_mission_with_ordered_steps() {
        let store = test_store().await;
        let steps = steps();
        let proposal = NewProposal {
            agent_id: "chora",
            title: "Scan and draft",
            description: None,
            steps: &steps,
            source: ProposalSource::Agent,
            source_trace_id: None,
        };
        let id = store
            .insert_proposal(&proposal, ProposalStatus::Pending, None)
            .await
            .unwrap();
        let mission_id = store
            .accept_proposal_with_mission(&id, "chora", "Scan and draft", None, &steps)
            .await
            .unwrap()
            .expect("mission created");

        let mission = store.get_mission(&mission_id).await.unwrap().unwrap();
        assert_eq!(mission.status, MissionStatus::Approved);
        assert_eq!(mission.proposal_id, id);

        let tally = store.step_tally(&mission_id).await.unwrap();
        assert_eq!(tally.queued, 2);

        let record = store.get_proposal(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ProposalStatus::Accepted);
        assert!(record.auto_approved);

        let again = store
            .accept_proposal_with_mission(&id, "chora", "Scan and draft", None, &steps)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn counts_only_recent_proposals_for_agent() {
        let store = test_store().await;
        let steps = steps();
        for agent in ["chora", "chora", "thaum"] {
            let proposal = NewProposal {
                agent_id: agent,
                title: "t",
                description: None,
                steps: &steps,
                source: ProposalSource::Manual,
                source_trace_id: None,
            };
            store
                .insert_proposal(&proposal, ProposalStatus::Rejected, Some("no"))
                .await
                .unwrap();
        }
        let since = super::super::today_start();
        assert_eq!(store.count_proposals_since("chora", &since).await.unwrap(), 2);
        assert_eq!(store.count_proposals_since("mux", &since).await.unwrap(), 0);
    }
}
