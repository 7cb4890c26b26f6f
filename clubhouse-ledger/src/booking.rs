use chrono::Utc;
use clubhouse_core::models::{Booking, BookingStatus, NewBooking, PricingSnapshot};
use clubhouse_core::repository::BookingRepository;
use clubhouse_core::{LedgerError, LedgerResult};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::commission::{CommissionCalculator, PricingInput};

#[derive(Debug, Clone)]
pub struct RecordBooking {
    pub offer_id: Uuid,
    pub subscriber_id: Uuid,
    pub quantity: u32,
    pub payment_intent_id: Option<String>,
    pub status: BookingStatus,
}

/// Freezes the commission split onto a booking when it is created. Later
/// rate changes never touch existing bookings.
pub struct BookingRecorder {
    bookings: Arc<dyn BookingRepository>,
    calculator: CommissionCalculator,
}

impl BookingRecorder {
    pub fn new(bookings: Arc<dyn BookingRepository>, calculator: CommissionCalculator) -> Self {
        Self { bookings, calculator }
    }

    pub async fn quote(&self, offer_id: Uuid, quantity: u32) -> LedgerResult<PricingSnapshot> {
        let offer = self
            .bookings
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("offer", offer_id))?;
        self.calculator.snapshot(&PricingInput::from_offer(&offer, quantity))
    }

    pub async fn record(&self, request: RecordBooking) -> LedgerResult<Booking> {
        if request.status == BookingStatus::Cancelled {
            return Err(LedgerError::Validation(
                "A booking cannot be created in cancelled status".to_string(),
            ));
        }

        let offer = self
            .bookings
            .get_offer(request.offer_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("offer", request.offer_id))?;
        let pricing = self
            .calculator
            .snapshot(&PricingInput::from_offer(&offer, request.quantity))?;

        let booking = self
            .bookings
            .insert_booking(&NewBooking {
                id: Uuid::new_v4(),
                partner_id: offer.partner_id,
                offer_id: offer.id,
                subscriber_id: request.subscriber_id,
                status: request.status,
                pricing,
                payment_intent_id: request.payment_intent_id,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            booking_id = %booking.id,
            partner_id = %booking.partner_id,
            total = pricing.total_amount,
            platform_fee = pricing.platform_fee,
            partner_earnings = pricing.partner_earnings,
            "Booking recorded"
        );
        Ok(booking)
    }
}
