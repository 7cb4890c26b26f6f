use async_trait::async_trait;
use clubhouse_core::models::Partner;
use clubhouse_core::repository::PartnerRepository;
use clubhouse_core::{StoreError, StoreResult};
use clubhouse_shared::Masked;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::db_err;

pub struct StorePartnerRepository {
    pool: PgPool,
}

impl StorePartnerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PartnerRow {
    id: Uuid,
    owner_user_id: Uuid,
    name: String,
    email: String,
    connected_account_id: Option<String>,
    charges_enabled: bool,
    pending_penalties: i64,
}

impl From<PartnerRow> for Partner {
    fn from(r: PartnerRow) -> Self {
        Partner {
            id: r.id,
            owner_user_id: r.owner_user_id,
            name: r.name,
            email: Masked(r.email),
            connected_account_id: r.connected_account_id,
            charges_enabled: r.charges_enabled,
            pending_penalties: r.pending_penalties,
        }
    }
}

const PARTNER_COLUMNS: &str =
    "id, owner_user_id, name, email, connected_account_id, charges_enabled, pending_penalties";

#[async_trait]
impl PartnerRepository for StorePartnerRepository {
    async fn get_partner(&self, partner_id: Uuid) -> StoreResult<Option<Partner>> {
        let row: Option<PartnerRow> =
            sqlx::query_as(&format!("SELECT {} FROM partners WHERE id = $1", PARTNER_COLUMNS))
                .bind(partner_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(Partner::from))
    }

    async fn partners_with_pending_penalties(&self) -> StoreResult<Vec<Partner>> {
        let rows: Vec<PartnerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM partners WHERE pending_penalties > 0 ORDER BY id",
            PARTNER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Partner::from).collect())
    }

    async fn set_charges_enabled(&self, partner_id: Uuid, enabled: bool) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE partners SET charges_enabled = $2, updated_at = NOW() WHERE id = $1")
            .bind(partner_id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("partner {}", partner_id)));
        }
        Ok(())
    }
}
