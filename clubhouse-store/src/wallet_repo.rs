use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::models::{DebitOutcome, WalletTransaction};
use clubhouse_core::repository::WalletRepository;
use clubhouse_core::{Money, StoreError, StoreResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::db_err;

pub struct StoreWalletRepository {
    pool: PgPool,
}

impl StoreWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletRepository for StoreWalletRepository {
    async fn debit(&self, user_id: Uuid, partner_id: Uuid, amount: Money) -> StoreResult<DebitOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let partner_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM partners WHERE id = $1)")
            .bind(partner_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if !partner_exists {
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::NotFound(format!("partner {}", partner_id)));
        }

        // Row lock serialises concurrent debits of the same wallet.
        let balance: Option<i64> = sqlx::query_scalar(
            "SELECT balance FROM wallets WHERE user_id = $1 AND partner_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(partner_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let balance = balance.unwrap_or(0);

        if balance < amount {
            tx.rollback().await.map_err(db_err)?;
            return Ok(DebitOutcome::InsufficientFunds {
                balance,
                requested: amount,
            });
        }

        let balance_after: i64 = sqlx::query_scalar(
            r#"
            UPDATE wallets SET balance = balance - $3, updated_at = NOW()
            WHERE user_id = $1 AND partner_id = $2
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(partner_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let id = Uuid::new_v4();
        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO wallet_transactions (id, user_id, partner_id, amount, balance_after)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(partner_id)
        .bind(amount)
        .bind(balance_after)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(DebitOutcome::Completed(WalletTransaction {
            id,
            user_id,
            partner_id,
            amount,
            balance_after,
            created_at,
        }))
    }
}
