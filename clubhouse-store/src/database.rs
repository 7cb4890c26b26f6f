use clubhouse_core::{StoreError, StoreResult};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::app_config::BusinessRules;

/// Maps sqlx failures onto the store error taxonomy.
pub(crate) fn db_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
            StoreError::Constraint(db.message().to_string())
        }
        _ => StoreError::backend(err),
    }
}

/// Parses a text status column into its enum.
pub(crate) fn decode<T>(raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    raw.parse::<T>().map_err(StoreError::backend)
}

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn fetch_business_rules(&self, defaults: BusinessRules) -> Result<BusinessRules, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct RuleRow {
            rule_key: String,
            rule_value: Value,
        }

        let rows: Vec<RuleRow> = sqlx::query_as("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;
        for row in rows {
            apply_rule(&mut rules, &row.rule_key, &row.rule_value);
        }
        Ok(rules)
    }
}

/// Rows look like `{"value": <number>}`; unknown keys and bad values are ignored.
fn apply_rule(rules: &mut BusinessRules, key: &str, raw: &Value) {
    let Some(v) = raw.get("value") else {
        warn!(rule_key = key, "Business rule without a value field");
        return;
    };
    match key {
        "management_fee" => {
            if let Some(fee) = v.as_i64().filter(|fee| *fee >= 0) {
                rules.management_fee = fee;
            }
        }
        "default_commission_bps" => {
            if let Some(bps) = v.as_u64().filter(|bps| *bps <= 10_000) {
                rules.default_commission_bps = bps as u32;
            }
        }
        "cancellation_reason_min_len" => {
            if let Some(len) = v.as_u64() {
                rules.cancellation_reason_min_len = len as usize;
            }
        }
        "reminder_days_ahead" => {
            if let Some(days) = v.as_u64() {
                rules.reminder_days_ahead = days as u32;
            }
        }
        _ => {}
    }
}
