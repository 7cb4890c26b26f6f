use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clubhouse_core::models::{BillingPeriod, Payout, PayoutDraft, PayoutStatement, PayoutUpsert};
use clubhouse_core::repository::PayoutRepository;
use clubhouse_core::{Money, StoreError, StoreResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{db_err, decode};

pub struct StorePayoutRepository {
    pool: PgPool,
}

impl StorePayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PAYOUT_COLUMNS: &str = "id, partner_id, period_start, period_end, gross_earnings, penalties_applied, \
     booking_count, net_amount, status, transfer_id, transfer_attempted_at, transfer_round, statement_url, failure_note, \
     created_at, updated_at, paid_at";

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    partner_id: Uuid,
    period_start: NaiveDate,
    period_end: NaiveDate,
    gross_earnings: i64,
    penalties_applied: i64,
    booking_count: i64,
    net_amount: i64,
    status: String,
    transfer_id: Option<String>,
    transfer_attempted_at: Option<DateTime<Utc>>,
    transfer_round: i32,
    statement_url: Option<String>,
    failure_note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl PayoutRow {
    fn into_payout(self) -> StoreResult<Payout> {
        Ok(Payout {
            id: self.id,
            partner_id: self.partner_id,
            period: BillingPeriod {
                start: self.period_start,
                end: self.period_end,
            },
            gross_earnings: self.gross_earnings,
            penalties_applied: self.penalties_applied,
            booking_count: self.booking_count,
            net_amount: self.net_amount,
            status: decode(&self.status)?,
            transfer_id: self.transfer_id,
            transfer_attempted_at: self.transfer_attempted_at,
            transfer_round: self.transfer_round,
            statement_url: self.statement_url,
            failure_note: self.failure_note,
            created_at: self.created_at,
            updated_at: self.updated_at,
            paid_at: self.paid_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    payout: PayoutRow,
    inserted: bool,
}

#[derive(sqlx::FromRow)]
struct StatementRow {
    payout_id: Uuid,
    partner_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl PayoutRepository for StorePayoutRepository {
    async fn upsert_payout(&self, draft: &PayoutDraft) -> StoreResult<PayoutUpsert> {
        // A failed payout is reopened under a new transfer round. Closed rows and
        // rows with a transfer attempt on record fall through to the SELECT below.
        let upserted: Option<UpsertRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payouts (id, partner_id, period_start, period_end, gross_earnings,
                                 penalties_applied, booking_count, net_amount, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
            ON CONFLICT (partner_id, period_start, period_end) DO UPDATE
            SET gross_earnings = EXCLUDED.gross_earnings,
                penalties_applied = EXCLUDED.penalties_applied,
                booking_count = EXCLUDED.booking_count,
                net_amount = EXCLUDED.net_amount,
                transfer_round = payouts.transfer_round + CASE WHEN payouts.status = 'failed' THEN 1 ELSE 0 END,
                status = 'pending',
                failure_note = NULL,
                updated_at = NOW()
            WHERE payouts.status IN ('pending', 'failed') AND payouts.transfer_attempted_at IS NULL
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(draft.partner_id)
        .bind(draft.period.start)
        .bind(draft.period.end)
        .bind(draft.gross_earnings)
        .bind(draft.penalties_applied)
        .bind(draft.booking_count)
        .bind(draft.net_amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = upserted {
            let inserted = row.inserted;
            let payout = row.payout.into_payout()?;
            return Ok(if inserted {
                PayoutUpsert::Created(payout)
            } else {
                PayoutUpsert::Updated(payout)
            });
        }

        let kept: PayoutRow = sqlx::query_as(&format!(
            "SELECT {} FROM payouts WHERE partner_id = $1 AND period_start = $2 AND period_end = $3",
            PAYOUT_COLUMNS
        ))
        .bind(draft.partner_id)
        .bind(draft.period.start)
        .bind(draft.period.end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let kept = kept.into_payout()?;
        Ok(if kept.is_closed() {
            PayoutUpsert::Closed(kept)
        } else {
            PayoutUpsert::InFlight(kept)
        })
    }

    async fn get_payout(&self, payout_id: Uuid) -> StoreResult<Option<Payout>> {
        let row: Option<PayoutRow> =
            sqlx::query_as(&format!("SELECT {} FROM payouts WHERE id = $1", PAYOUT_COLUMNS))
                .bind(payout_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(PayoutRow::into_payout).transpose()
    }

    async fn committed_penalties(&self, partner_id: Uuid, period: &BillingPeriod) -> StoreResult<Money> {
        let committed: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(penalties_applied), 0)::BIGINT
            FROM payouts
            WHERE partner_id = $1 AND status = 'pending'
              AND (period_start, period_end) <> ($2, $3)
            "#,
        )
        .bind(partner_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(committed)
    }

    async fn pending_payouts(&self) -> StoreResult<Vec<Payout>> {
        let rows: Vec<PayoutRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payouts WHERE status = 'pending' ORDER BY created_at",
            PAYOUT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PayoutRow::into_payout).collect()
    }

    async fn begin_transfer(&self, payout_id: Uuid) -> StoreResult<Option<Payout>> {
        let row: Option<PayoutRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payouts
            SET transfer_attempted_at = COALESCE(transfer_attempted_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(PayoutRow::into_payout).transpose()
    }

    async fn mark_payout_paid(
        &self,
        payout_id: Uuid,
        partner_id: Uuid,
        transfer_id: &str,
        penalties_settled: Money,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'paid', transfer_id = $2, paid_at = NOW(), failure_note = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(payout_id)
        .bind(transfer_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        if penalties_settled > 0 {
            sqlx::query(
                r#"
                UPDATE partners
                SET pending_penalties = GREATEST(pending_penalties - $2, 0), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(partner_id)
            .bind(penalties_settled)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn settle_without_transfer(&self, payout_id: Uuid, partner_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let settled: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE payouts
            SET status = 'settled', paid_at = NOW(), failure_note = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND net_amount <= 0
            RETURNING penalties_applied
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(penalties) = settled else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        };

        if penalties > 0 {
            sqlx::query(
                r#"
                UPDATE partners
                SET pending_penalties = GREATEST(pending_penalties - $2, 0), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(partner_id)
            .bind(penalties)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, note: &str) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'failed', failure_note = $2, transfer_attempted_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(payout_id)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("pending payout {}", payout_id)));
        }
        Ok(())
    }

    async fn note_payout_attempt(&self, payout_id: Uuid, note: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE payouts SET failure_note = $2, updated_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(payout_id)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_statement_url(&self, payout_id: Uuid, url: &str) -> StoreResult<()> {
        sqlx::query("UPDATE payouts SET statement_url = $2, updated_at = NOW() WHERE id = $1")
            .bind(payout_id)
            .bind(url)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn save_statement(&self, statement: &PayoutStatement) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payout_statements (payout_id, partner_id, content, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (payout_id) DO UPDATE SET content = EXCLUDED.content, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(statement.payout_id)
        .bind(statement.partner_id)
        .bind(&statement.content)
        .bind(statement.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_statement(&self, payout_id: Uuid) -> StoreResult<Option<PayoutStatement>> {
        let row: Option<StatementRow> = sqlx::query_as(
            "SELECT payout_id, partner_id, content, created_at FROM payout_statements WHERE payout_id = $1",
        )
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| PayoutStatement {
            payout_id: r.payout_id,
            partner_id: r.partner_id,
            content: r.content,
            created_at: r.created_at,
        }))
    }
}
