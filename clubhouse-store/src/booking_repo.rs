use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::models::{
    BillingPeriod, Booking, BookingContext, BookingStatus, CancellationRecord, NewBooking, Offer,
    Partner, PartnerEarnings, PricingSnapshot,
};
use clubhouse_core::repository::BookingRepository;
use clubhouse_core::{StoreError, StoreResult};
use clubhouse_shared::Masked;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{db_err, decode};

pub struct StoreBookingRepository {
    pool: PgPool,
}

impl StoreBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BOOKING_COLUMNS: &str = "id, partner_id, offer_id, subscriber_id, status, unit_amount, quantity, \
     total_amount, commission_bps, platform_fee, partner_earnings, payment_intent_id, cancelled_by, \
     cancellation_reason, cancelled_at, refund_id, processor_fee, management_fee, penalty, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    partner_id: Uuid,
    offer_id: Uuid,
    subscriber_id: Uuid,
    status: String,
    unit_amount: i64,
    quantity: i32,
    total_amount: i64,
    commission_bps: i32,
    platform_fee: i64,
    partner_earnings: i64,
    payment_intent_id: Option<String>,
    cancelled_by: Option<Uuid>,
    cancellation_reason: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    refund_id: Option<String>,
    processor_fee: Option<i64>,
    management_fee: Option<i64>,
    penalty: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BookingRow {
    fn into_booking(self) -> StoreResult<Booking> {
        let status: BookingStatus = decode(&self.status)?;
        let cancellation = match (status, self.cancelled_by, self.cancelled_at) {
            (BookingStatus::Cancelled, Some(cancelled_by), Some(cancelled_at)) => Some(CancellationRecord {
                cancelled_by,
                reason: self.cancellation_reason.unwrap_or_default(),
                cancelled_at,
                refund_id: self.refund_id,
                processor_fee: self.processor_fee.unwrap_or(0),
                management_fee: self.management_fee.unwrap_or(0),
                penalty: self.penalty.unwrap_or(0),
            }),
            _ => None,
        };

        Ok(Booking {
            id: self.id,
            partner_id: self.partner_id,
            offer_id: self.offer_id,
            subscriber_id: self.subscriber_id,
            amount: self.total_amount,
            status,
            pricing: PricingSnapshot {
                unit_amount: self.unit_amount,
                quantity: self.quantity.max(0) as u32,
                total_amount: self.total_amount,
                commission_bps: self.commission_bps.max(0) as u32,
                platform_fee: self.platform_fee,
                partner_earnings: self.partner_earnings,
            },
            payment_intent_id: self.payment_intent_id,
            cancellation,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    #[sqlx(flatten)]
    booking: BookingRow,
    offer_title: String,
    partner_owner_user_id: Uuid,
    partner_name: String,
    partner_email: String,
    partner_connected_account_id: Option<String>,
    partner_charges_enabled: bool,
    partner_pending_penalties: i64,
    subscriber_email: String,
    subscriber_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct OfferRow {
    id: Uuid,
    partner_id: Uuid,
    title: String,
    base_price: i64,
    promo_price: Option<i64>,
    commission_bps: Option<i32>,
}

#[derive(sqlx::FromRow)]
struct EarningsRow {
    partner_id: Uuid,
    gross_earnings: i64,
    booking_count: i64,
}

#[async_trait]
impl BookingRepository for StoreBookingRepository {
    async fn get_offer(&self, offer_id: Uuid) -> StoreResult<Option<Offer>> {
        let row: Option<OfferRow> = sqlx::query_as(
            "SELECT id, partner_id, title, base_price, promo_price, commission_bps FROM offers WHERE id = $1",
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Offer {
            id: r.id,
            partner_id: r.partner_id,
            title: r.title,
            base_price: r.base_price,
            promo_price: r.promo_price,
            commission_bps: r.commission_bps.map(|bps| bps.max(0) as u32),
        }))
    }

    async fn insert_booking(&self, booking: &NewBooking) -> StoreResult<Booking> {
        let pricing = &booking.pricing;
        let row: BookingRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO bookings (id, partner_id, offer_id, subscriber_id, status, unit_amount, quantity,
                                  total_amount, commission_bps, platform_fee, partner_earnings,
                                  payment_intent_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(booking.id)
        .bind(booking.partner_id)
        .bind(booking.offer_id)
        .bind(booking.subscriber_id)
        .bind(booking.status.as_str())
        .bind(pricing.unit_amount)
        .bind(pricing.quantity as i32)
        .bind(pricing.total_amount)
        .bind(pricing.commission_bps as i32)
        .bind(pricing.platform_fee)
        .bind(pricing.partner_earnings)
        .bind(&booking.payment_intent_id)
        .bind(booking.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.into_booking()
    }

    async fn get_booking_context(&self, booking_id: Uuid) -> StoreResult<Option<BookingContext>> {
        let row: Option<ContextRow> = sqlx::query_as(
            r#"
            SELECT b.id, b.partner_id, b.offer_id, b.subscriber_id, b.status, b.unit_amount, b.quantity,
                   b.total_amount, b.commission_bps, b.platform_fee, b.partner_earnings, b.payment_intent_id,
                   b.cancelled_by, b.cancellation_reason, b.cancelled_at, b.refund_id, b.processor_fee,
                   b.management_fee, b.penalty, b.created_at, b.updated_at,
                   o.title AS offer_title,
                   p.owner_user_id AS partner_owner_user_id,
                   p.name AS partner_name,
                   p.email AS partner_email,
                   p.connected_account_id AS partner_connected_account_id,
                   p.charges_enabled AS partner_charges_enabled,
                   p.pending_penalties AS partner_pending_penalties,
                   u.email AS subscriber_email,
                   u.full_name AS subscriber_name
            FROM bookings b
            JOIN offers o ON o.id = b.offer_id
            JOIN partners p ON p.id = b.partner_id
            JOIN users u ON u.id = b.subscriber_id
            WHERE b.id = $1
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let booking = row.booking.into_booking()?;
        Ok(Some(BookingContext {
            partner: Partner {
                id: booking.partner_id,
                owner_user_id: row.partner_owner_user_id,
                name: row.partner_name,
                email: Masked(row.partner_email),
                connected_account_id: row.partner_connected_account_id,
                charges_enabled: row.partner_charges_enabled,
                pending_penalties: row.partner_pending_penalties,
            },
            booking,
            offer_title: row.offer_title,
            subscriber_email: Masked(row.subscriber_email),
            subscriber_name: row.subscriber_name,
        }))
    }

    async fn record_cancellation(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        partner_id: Uuid,
        record: &CancellationRecord,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE bookings
            SET status = 'cancelled', cancelled_by = $3, cancellation_reason = $4, cancelled_at = $5,
                refund_id = $6, processor_fee = $7, management_fee = $8, penalty = $9, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(booking_id)
        .bind(expected.as_str())
        .bind(record.cancelled_by)
        .bind(&record.reason)
        .bind(record.cancelled_at)
        .bind(&record.refund_id)
        .bind(record.processor_fee)
        .bind(record.management_fee)
        .bind(record.penalty)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        let penalised = sqlx::query(
            "UPDATE partners SET pending_penalties = pending_penalties + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(partner_id)
        .bind(record.penalty)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if penalised == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::NotFound(format!("partner {}", partner_id)));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn settled_earnings(&self, period: &BillingPeriod) -> StoreResult<Vec<PartnerEarnings>> {
        let rows: Vec<EarningsRow> = sqlx::query_as(
            r#"
            SELECT partner_id,
                   SUM(partner_earnings)::BIGINT AS gross_earnings,
                   COUNT(*) AS booking_count
            FROM bookings
            WHERE status IN ('confirmed', 'paid')
              AND created_at >= $1 AND created_at < $2
            GROUP BY partner_id
            "#,
        )
        .bind(period.start_at())
        .bind(period.end_at())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| PartnerEarnings {
                partner_id: r.partner_id,
                gross_earnings: r.gross_earnings,
                booking_count: r.booking_count,
            })
            .collect())
    }
}
