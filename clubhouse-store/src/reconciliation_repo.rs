use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::models::{NewReconciliationEntry, ReconciliationEntry};
use clubhouse_core::repository::ReconciliationRepository;
use clubhouse_core::{StoreError, StoreResult};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{db_err, decode};

pub struct StoreReconciliationRepository {
    pool: PgPool,
}

impl StoreReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ENTRY_COLUMNS: &str =
    "id, kind, external_reference, entity_id, effect, status, attempts, last_error, created_at, resolved_at";

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    kind: String,
    external_reference: String,
    entity_id: Uuid,
    effect: Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl EntryRow {
    fn into_entry(self) -> StoreResult<ReconciliationEntry> {
        Ok(ReconciliationEntry {
            id: self.id,
            kind: decode(&self.kind)?,
            external_reference: self.external_reference,
            entity_id: self.entity_id,
            effect: serde_json::from_value(self.effect).map_err(StoreError::backend)?,
            status: decode(&self.status)?,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

#[async_trait]
impl ReconciliationRepository for StoreReconciliationRepository {
    async fn record_entry(&self, entry: &NewReconciliationEntry) -> StoreResult<ReconciliationEntry> {
        let effect = serde_json::to_value(&entry.effect).map_err(StoreError::backend)?;
        let row: EntryRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO reconciliation_entries (id, kind, external_reference, entity_id, effect, status, attempts, last_error)
            VALUES ($1, $2, $3, $4, $5, 'open', 0, $6)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.kind.as_str())
        .bind(&entry.external_reference)
        .bind(entry.entity_id)
        .bind(effect)
        .bind(&entry.last_error)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.into_entry()
    }

    async fn open_entries(&self, limit: i64) -> StoreResult<Vec<ReconciliationEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reconciliation_entries WHERE status = 'open' ORDER BY created_at LIMIT $1",
            ENTRY_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn mark_resolved(&self, entry_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE reconciliation_entries SET status = 'resolved', resolved_at = NOW() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_attempt(&self, entry_id: Uuid, error: &str) -> StoreResult<()> {
        sqlx::query("UPDATE reconciliation_entries SET attempts = attempts + 1, last_error = $2 WHERE id = $1")
            .bind(entry_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
