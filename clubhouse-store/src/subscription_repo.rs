use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clubhouse_core::models::{
    InstallmentDue, PaymentInstallment, Subscription, SubscriptionState,
};
use clubhouse_core::repository::{InstallmentRepository, SubscriptionRepository};
use clubhouse_core::{StoreError, StoreResult};
use clubhouse_shared::Masked;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{db_err, decode};

/// Subscriptions and installment plans, both keyed to a subscriber in `users`.
pub struct StoreSubscriptionRepository {
    pool: PgPool,
}

impl StoreSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    subscriber_id: Uuid,
    subscriber_email: String,
    subscriber_name: Option<String>,
    external_subscription_id: String,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    welcome_sent_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct InstallmentRow {
    id: Uuid,
    plan_id: Uuid,
    sequence: i32,
    due_date: NaiveDate,
    amount: i64,
    status: String,
    plan_description: String,
    installment_count: i32,
    subscriber_email: String,
    subscriber_name: Option<String>,
}

#[async_trait]
impl SubscriptionRepository for StoreSubscriptionRepository {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.subscriber_id, u.email AS subscriber_email, u.full_name AS subscriber_name,
                   s.external_subscription_id, s.status, s.current_period_end, s.cancel_at_period_end,
                   s.welcome_sent_at, s.updated_at
            FROM subscriptions s
            JOIN users u ON u.id = s.subscriber_id
            WHERE s.external_subscription_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| -> StoreResult<Subscription> {
            Ok(Subscription {
                id: r.id,
                subscriber_id: r.subscriber_id,
                subscriber_email: Masked(r.subscriber_email),
                subscriber_name: r.subscriber_name,
                external_subscription_id: r.external_subscription_id,
                status: decode(&r.status)?,
                current_period_end: r.current_period_end,
                cancel_at_period_end: r.cancel_at_period_end,
                welcome_sent_at: r.welcome_sent_at,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }

    async fn update_state(&self, subscription_id: Uuid, state: &SubscriptionState) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, current_period_end = $3, cancel_at_period_end = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(state.status.as_str())
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("subscription {}", subscription_id)));
        }
        Ok(())
    }

    async fn claim_welcome(&self, subscription_id: Uuid) -> StoreResult<bool> {
        let claimed = sqlx::query(
            "UPDATE subscriptions SET welcome_sent_at = NOW() WHERE id = $1 AND welcome_sent_at IS NULL",
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(claimed == 1)
    }
}

#[async_trait]
impl InstallmentRepository for StoreSubscriptionRepository {
    async fn pending_due_on(&self, due_date: NaiveDate) -> StoreResult<Vec<InstallmentDue>> {
        let rows: Vec<InstallmentRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.plan_id, i.sequence, i.due_date, i.amount, i.status,
                   p.description AS plan_description, p.installment_count,
                   u.email AS subscriber_email, u.full_name AS subscriber_name
            FROM payment_installments i
            JOIN payment_plans p ON p.id = i.plan_id
            JOIN users u ON u.id = p.subscriber_id
            WHERE i.status = 'pending' AND i.due_date = $1
            ORDER BY i.plan_id, i.sequence
            "#,
        )
        .bind(due_date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| -> StoreResult<InstallmentDue> {
                Ok(InstallmentDue {
                    installment: PaymentInstallment {
                        id: r.id,
                        plan_id: r.plan_id,
                        sequence: r.sequence,
                        due_date: r.due_date,
                        amount: r.amount,
                        status: decode(&r.status)?,
                    },
                    plan_description: r.plan_description,
                    installment_count: r.installment_count,
                    subscriber_email: Masked(r.subscriber_email),
                    subscriber_name: r.subscriber_name,
                })
            })
            .collect()
    }
}
