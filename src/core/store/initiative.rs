use anyhow::Result;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use super::types::{InitiativeContext, InitiativeRecord, InitiativeStatus};
use super::{OfficeStore, json_column, new_id, now_ts};

impl OfficeStore {
    pub async fn count_initiatives_since(&self, agent_id: &str, since: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row(
            "SELECT COUNT(*) FROM initiative_queue WHERE agent_id = ?1 AND created_at >= ?2",
            params![agent_id, since],
            |row| row.get(0),
        )?)
    }

    pub async fn insert_initiative(&self, context: &InitiativeContext) -> Result<String> {
        let id = new_id();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO initiative_queue (id, agent_id, status, context, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                context.agent_id,
                InitiativeStatus::Pending,
                serde_json::to_string(context)?,
                now_ts()
            ],
        )?;
        Ok(id)
    }

    /// Claim the oldest pending initiative.
    pub async fn claim_initiative(&self) -> Result<Option<InitiativeRecord>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx
            .query_row(
                "UPDATE initiative_queue SET status = 'processing' \
                 WHERE id = (SELECT id FROM initiative_queue WHERE status = 'pending' \
                             ORDER BY created_at ASC LIMIT 1) \
                 AND status = 'pending' \
                 RETURNING id, agent_id, status, context, result, created_at",
                [],
                |row| {
                    let result: Option<String> = row.get(4)?;
                    Ok(InitiativeRecord {
                        id: row.get(0)?,
                        agent_id: row.get(1)?,
                        status: row.get(2)?,
                        context: json_column(3, row.get(3)?)?,
                        result: result.map(|raw| json_column(4, raw)).transpose()?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        tx.commit()?;
        Ok(claimed)
    }

    pub async fn finish_initiative(
        &self,
        id: &str,
        status: InitiativeStatus,
        result: &Value,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE initiative_queue SET status = ?1, result = ?2, processed_at = ?3 \
             WHERE id = ?4 AND status = 'processing'",
            params![status, serde_json::to_string(result)?, now_ts(), id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{minutes_ago, test_store};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn initiative_lifecycle() {
        let store = test_store().await;
        let context = InitiativeContext {
            agent_id: "thaum".into(),
            memories: Vec::new(),
        };
        let id = store.insert_initiative(&context).await.unwrap();
        assert_eq!(
            store.count_initiatives_since("thaum", &minutes_ago(240)).await.unwrap(),
            1
        );

        let claimed = store.claim_initiative().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, InitiativeStatus::Processing);
        assert_eq!(claimed.context, context);
        assert!(store.claim_initiative().await.unwrap().is_none());

        assert!(
            store
                .finish_initiative(&id, InitiativeStatus::Completed, &json!({"proposal_id": "p"}))
                .await
                .unwrap()
        );
        assert!(
            !store
                .finish_initiative(&id, InitiativeStatus::Failed, &json!({}))
                .await
                .unwrap()
        );
    }
}
