use async_trait::async_trait;
use clubhouse_core::models::EmailMessage;
use clubhouse_core::repository::NotificationQueue;
use clubhouse_core::StoreResult;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::db_err;

/// Insert-only access to `email_queue`; a separate sender drains it.
pub struct StoreNotificationQueue {
    pool: PgPool,
}

impl StoreNotificationQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationQueue for StoreNotificationQueue {
    async fn enqueue(&self, message: &EmailMessage) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO email_queue (id, to_address, subject, content, status) VALUES ($1, $2, $3, $4, 'pending')",
        )
        .bind(id)
        .bind(message.to_address.expose())
        .bind(&message.subject)
        .bind(&message.content)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }
}
