use chrono::Utc;
use clubhouse_core::models::{
    BookingContext, BookingStatus, CancellationRecord, LocalEffect, NewReconciliationEntry,
    ReconciliationKind,
};
use clubhouse_core::payment::{PaymentProcessor, Refund, RefundRequest};
use clubhouse_core::repository::{BookingRepository, ReconciliationRepository};
use clubhouse_core::{AuthenticatedUser, LedgerError, LedgerResult, Money};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notifications::Notifier;
use crate::reconciliation;
use crate::retry::RetryPolicy;

/// Processor metadata values are capped at 500 characters.
const METADATA_VALUE_LIMIT: usize = 500;

/// How often a status guard lost to a concurrent transition is retried.
const STATUS_RACE_RETRIES: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct CancellationSettings {
    pub management_fee: Money,
    pub min_reason_len: usize,
}

impl Default for CancellationSettings {
    fn default() -> Self {
        Self {
            management_fee: 500,
            min_reason_len: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationReceipt {
    pub booking_id: Uuid,
    pub refund_id: Option<String>,
    pub refunded_amount: Money,
    pub processor_fee: Money,
    pub management_fee: Money,
    pub penalty: Money,
    /// Set when the refund went through but the local write did not.
    pub reconciliation_id: Option<Uuid>,
}

enum Persisted {
    Recorded,
    AlreadyCancelled,
    /// Refund went out but the write did not land; carries the entry id if one was recorded.
    Flagged(Option<Uuid>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancellationOutcome {
    Cancelled(CancellationReceipt),
    AlreadyCancelled { booking_id: Uuid },
}

/// Partner-initiated cancellation: full refund to the subscriber, processing
/// fee plus management fee charged to the partner as a pending penalty.
pub struct CancellationProcessor {
    bookings: Arc<dyn BookingRepository>,
    reconciliation: Arc<dyn ReconciliationRepository>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Notifier,
    retry: RetryPolicy,
    settings: CancellationSettings,
}

impl CancellationProcessor {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        reconciliation: Arc<dyn ReconciliationRepository>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Notifier,
        retry: RetryPolicy,
        settings: CancellationSettings,
    ) -> Self {
        Self {
            bookings,
            reconciliation,
            processor,
            notifier,
            retry,
            settings,
        }
    }

    pub async fn cancel(
        &self,
        caller: &AuthenticatedUser,
        booking_id: Uuid,
        reason: &str,
    ) -> LedgerResult<CancellationOutcome> {
        let reason = reason.trim();
        if reason.chars().count() < self.settings.min_reason_len {
            return Err(LedgerError::Validation(format!(
                "Cancellation reason must be at least {} characters",
                self.settings.min_reason_len
            )));
        }

        let ctx = self
            .bookings
            .get_booking_context(booking_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("booking", booking_id))?;

        if ctx.partner.owner_user_id != caller.user_id {
            warn!(%booking_id, user_id = %caller.user_id, "Cancellation attempted by non-owner");
            return Err(LedgerError::Unauthorized(
                "Booking does not belong to your partner account".to_string(),
            ));
        }

        if ctx.booking.status == BookingStatus::Cancelled {
            info!(%booking_id, "Booking already cancelled, nothing to do");
            return Ok(CancellationOutcome::AlreadyCancelled { booking_id });
        }

        let (processor_fee, refund) = match ctx.booking.payment_intent_id.as_deref() {
            Some(payment_intent_id) => {
                let fee = self.lookup_fee(payment_intent_id).await?;
                let refund = self.refund(&ctx, payment_intent_id, reason).await?;
                (fee, Some(refund))
            }
            None => (0, None),
        };

        let management_fee = self.settings.management_fee;
        let record = CancellationRecord {
            cancelled_by: caller.user_id,
            reason: reason.to_string(),
            cancelled_at: Utc::now(),
            refund_id: refund.as_ref().map(|r| r.id.clone()),
            processor_fee,
            management_fee,
            penalty: processor_fee + management_fee,
        };

        let reconciliation_id = match self.persist(&ctx, &record, refund.as_ref()).await? {
            Persisted::Recorded => {
                info!(
                    %booking_id,
                    partner_id = %ctx.partner.id,
                    penalty = record.penalty,
                    refund_id = ?record.refund_id,
                    "Booking cancelled"
                );
                None
            }
            Persisted::AlreadyCancelled => {
                warn!(%booking_id, "Booking was cancelled concurrently; another cancellation won");
                return Ok(CancellationOutcome::AlreadyCancelled { booking_id });
            }
            Persisted::Flagged(entry_id) => entry_id,
        };

        self.notifier
            .deliver(self.notifier.refund_confirmation(&ctx, &record), "refund_confirmation")
            .await;
        self.notifier
            .deliver(self.notifier.cancellation_fee_recap(&ctx, &record), "cancellation_fee_recap")
            .await;

        Ok(CancellationOutcome::Cancelled(CancellationReceipt {
            booking_id,
            refund_id: record.refund_id,
            refunded_amount: if refund.is_some() { ctx.booking.amount } else { 0 },
            processor_fee,
            management_fee,
            penalty: record.penalty,
            reconciliation_id,
        }))
    }

    /// Writes the cancellation under the booking's status guard. A lost guard
    /// is re-read: a booking cancelled by someone else is a no-op, any other
    /// status is retried from where the booking is now. Once a refund has gone
    /// out, a write that still does not land is flagged for reconciliation.
    async fn persist(
        &self,
        ctx: &BookingContext,
        record: &CancellationRecord,
        refund: Option<&Refund>,
    ) -> LedgerResult<Persisted> {
        let booking_id = ctx.booking.id;
        let mut expected = ctx.booking.status;
        let mut races = 0;

        let failure: LedgerError = loop {
            match self
                .bookings
                .record_cancellation(booking_id, expected, ctx.partner.id, record)
                .await
            {
                Ok(true) => return Ok(Persisted::Recorded),
                Ok(false) => {}
                Err(e) => break e.into(),
            }

            let current = match self.bookings.get_booking_context(booking_id).await {
                Ok(Some(latest)) => latest.booking.status,
                Ok(None) => break LedgerError::not_found("booking", booking_id),
                Err(e) => break e.into(),
            };
            if current == BookingStatus::Cancelled {
                return Ok(Persisted::AlreadyCancelled);
            }
            races += 1;
            if races > STATUS_RACE_RETRIES {
                break LedgerError::Conflict(format!(
                    "Booking {} kept changing status during cancellation",
                    booking_id
                ));
            }
            warn!(%booking_id, from = %expected, to = %current, "Booking changed status mid-cancellation; retrying");
            expected = current;
        };

        let Some(refund) = refund else {
            return Err(failure);
        };
        error!(
            %booking_id,
            refund_id = %refund.id,
            error = %failure,
            "PARTIAL FAILURE: refund issued but cancellation was not recorded"
        );
        let entry_id = reconciliation::flag(
            self.reconciliation.as_ref(),
            NewReconciliationEntry {
                kind: ReconciliationKind::Refund,
                external_reference: refund.id.clone(),
                entity_id: booking_id,
                effect: LocalEffect::CancelBooking {
                    booking_id,
                    partner_id: ctx.partner.id,
                    expected_status: expected,
                    record: record.clone(),
                },
                last_error: Some(failure.to_string()),
            },
        )
        .await;
        Ok(Persisted::Flagged(entry_id))
    }

    async fn lookup_fee(&self, payment_intent_id: &str) -> LedgerResult<Money> {
        let processor = self.processor.as_ref();
        self.retry
            .run("charge_fee", move || processor.charge_fee(payment_intent_id))
            .await
            .map_err(|e| {
                error!(payment_intent_id, error = %e, "Could not read processing fee; aborting cancellation");
                LedgerError::External(e)
            })
    }

    async fn refund(&self, ctx: &BookingContext, payment_intent_id: &str, reason: &str) -> LedgerResult<Refund> {
        let booking = &ctx.booking;
        let mut metadata = BTreeMap::new();
        metadata.insert("cancellation_source".to_string(), "partner".to_string());
        metadata.insert("booking_id".to_string(), booking.id.to_string());
        metadata.insert("partner_id".to_string(), ctx.partner.id.to_string());
        metadata.insert(
            "reason".to_string(),
            reason.chars().take(METADATA_VALUE_LIMIT).collect(),
        );

        let request = RefundRequest {
            payment_intent_id: payment_intent_id.to_string(),
            amount: booking.amount,
            idempotency_key: format!("refund-{}", booking.id),
            metadata,
        };

        let processor = self.processor.as_ref();
        let request = &request;
        match self
            .retry
            .run("create_refund", move || processor.create_refund(request))
            .await
        {
            Ok(refund) => Ok(refund),
            Err(e) if e.is_unknown_outcome() => {
                warn!(booking_id = %booking.id, "Refund outcome unknown, checking with processor");
                let found = self
                    .retry
                    .run("find_refund", move || processor.find_refund(payment_intent_id))
                    .await?;
                match found {
                    Some(refund) => {
                        info!(booking_id = %booking.id, refund_id = %refund.id, "Refund confirmed after timeout");
                        Ok(refund)
                    }
                    None => Err(LedgerError::External(e)),
                }
            }
            Err(e) => {
                error!(booking_id = %booking.id, error = %e, "Refund rejected; booking left unchanged");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use async_trait::async_trait;
    use clubhouse_core::models::{
        BillingPeriod, Booking, NewBooking, Offer, PartnerEarnings, ReconciliationStatus,
    };
    use clubhouse_core::{MockPaymentProcessor, ProcessorError, Role, StoreResult};
    use clubhouse_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REASON: &str = "Venue flooded, cannot host the session";

    struct Harness {
        store: Arc<InMemoryStore>,
        processor: Arc<MockPaymentProcessor>,
        service: CancellationProcessor,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(MockPaymentProcessor::with_default_fee(320));
        let service = CancellationProcessor::new(
            store.clone(),
            store.clone(),
            processor.clone(),
            Notifier::new(store.clone(), "eur"),
            RetryPolicy::no_retry(),
            CancellationSettings::default(),
        );
        Harness {
            store,
            processor,
            service,
        }
    }

    /// Moves the booking between `confirmed` and `paid` right before the
    /// next `flips` guarded writes, as a concurrent settlement would.
    struct ShiftingStatus {
        store: Arc<InMemoryStore>,
        flips: AtomicUsize,
    }

    #[async_trait]
    impl BookingRepository for ShiftingStatus {
        async fn get_offer(&self, offer_id: Uuid) -> StoreResult<Option<Offer>> {
            self.store.get_offer(offer_id).await
        }

        async fn insert_booking(&self, booking: &NewBooking) -> StoreResult<Booking> {
            self.store.insert_booking(booking).await
        }

        async fn get_booking_context(&self, booking_id: Uuid) -> StoreResult<Option<BookingContext>> {
            self.store.get_booking_context(booking_id).await
        }

        async fn record_cancellation(
            &self,
            booking_id: Uuid,
            expected: BookingStatus,
            partner_id: Uuid,
            record: &CancellationRecord,
        ) -> StoreResult<bool> {
            let flip = self
                .flips
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if flip {
                if let Some(mut booking) = self.store.booking(booking_id) {
                    booking.status = match booking.status {
                        BookingStatus::Confirmed => BookingStatus::Paid,
                        _ => BookingStatus::Confirmed,
                    };
                    self.store.seed_booking(booking);
                }
            }
            self.store.record_cancellation(booking_id, expected, partner_id, record).await
        }

        async fn settled_earnings(&self, period: &BillingPeriod) -> StoreResult<Vec<PartnerEarnings>> {
            self.store.settled_earnings(period).await
        }
    }

    fn shifting_harness(flips: usize) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(MockPaymentProcessor::with_default_fee(320));
        let bookings = Arc::new(ShiftingStatus {
            store: store.clone(),
            flips: AtomicUsize::new(flips),
        });
        let service = CancellationProcessor::new(
            bookings,
            store.clone(),
            processor.clone(),
            Notifier::new(store.clone(), "eur"),
            RetryPolicy::no_retry(),
            CancellationSettings::default(),
        );
        Harness {
            store,
            processor,
            service,
        }
    }

    fn owner(fixture: &Fixture) -> AuthenticatedUser {
        AuthenticatedUser::new(fixture.partner.owner_user_id, Role::Partner)
    }

    #[tokio::test]
    async fn test_cancel_refunds_and_books_penalty() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        let receipt = match outcome {
            CancellationOutcome::Cancelled(receipt) => receipt,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(receipt.refunded_amount, 10_000);
        assert_eq!(receipt.processor_fee, 320);
        assert_eq!(receipt.management_fee, 500);
        assert_eq!(receipt.penalty, 820);
        assert!(receipt.reconciliation_id.is_none());

        let refunds = h.processor.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 10_000);

        let booking = h.store.booking(fx.booking.id).unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        let record = booking.cancellation.unwrap();
        assert_eq!(record.penalty, 820);
        assert_eq!(record.refund_id, Some(refunds[0].id.clone()));
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 820);
        assert_eq!(h.store.emails().len(), 2);
    }

    #[tokio::test]
    async fn test_second_cancel_is_a_no_op() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));

        h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();
        let again = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        assert!(matches!(again, CancellationOutcome::AlreadyCancelled { .. }));
        assert_eq!(h.processor.calls(MockPaymentProcessor::CREATE_REFUND), 1);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 820);
    }

    #[tokio::test]
    async fn test_non_owner_is_rejected_without_side_effects() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        let stranger = AuthenticatedUser::new(Uuid::new_v4(), Role::Partner);

        let result = h.service.cancel(&stranger, fx.booking.id, REASON).await;

        assert!(matches!(result, Err(LedgerError::Unauthorized(_))));
        assert_eq!(h.processor.calls(MockPaymentProcessor::CREATE_REFUND), 0);
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Paid);
    }

    #[tokio::test]
    async fn test_short_reason_and_missing_booking() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));

        let short = h.service.cancel(&owner(&fx), fx.booking.id, "  too short ").await;
        assert!(matches!(short, Err(LedgerError::Validation(_))));

        let missing = h.service.cancel(&owner(&fx), Uuid::new_v4(), REASON).await;
        assert!(matches!(missing, Err(LedgerError::NotFound { entity: "booking", .. })));
    }

    #[tokio::test]
    async fn test_fee_lookup_failure_aborts_before_refund() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        h.processor
            .fail_next(MockPaymentProcessor::CHARGE_FEE, ProcessorError::Network("down".to_string()));

        let result = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await;

        assert!(matches!(result, Err(LedgerError::External(_))));
        assert_eq!(h.processor.calls(MockPaymentProcessor::CREATE_REFUND), 0);
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Paid);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 0);
    }

    #[tokio::test]
    async fn test_refund_rejection_leaves_booking_untouched() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        h.processor.fail_next(
            MockPaymentProcessor::CREATE_REFUND,
            ProcessorError::Api {
                status: 400,
                code: Some("charge_already_refunded".to_string()),
                message: "already refunded".to_string(),
            },
        );

        let result = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await;

        assert!(matches!(result, Err(LedgerError::External(_))));
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Paid);
        assert!(h.store.emails().is_empty());
    }

    #[tokio::test]
    async fn test_refund_timeout_is_resolved_by_lookup() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        h.processor
            .fail_after_apply(MockPaymentProcessor::CREATE_REFUND, ProcessorError::Timeout);

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        assert!(matches!(outcome, CancellationOutcome::Cancelled(_)));
        assert_eq!(h.processor.calls(MockPaymentProcessor::FIND_REFUND), 1);
        assert_eq!(h.processor.refunds().len(), 1);
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_local_write_failure_after_refund_is_flagged() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        h.store.fail_on("record_cancellation");

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        let receipt = match outcome {
            CancellationOutcome::Cancelled(receipt) => receipt,
            other => panic!("unexpected outcome {:?}", other),
        };
        let entry_id = receipt.reconciliation_id.expect("reconciliation entry");
        let entries = h.store.reconciliation_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
        assert_eq!(entries[0].kind, ReconciliationKind::Refund);
        assert_eq!(entries[0].status, ReconciliationStatus::Open);
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Paid);
    }

    #[tokio::test]
    async fn test_unpaid_booking_cancels_without_processor() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 4_000, BookingStatus::Pending, None);

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        match outcome {
            CancellationOutcome::Cancelled(receipt) => {
                assert_eq!(receipt.refunded_amount, 0);
                assert_eq!(receipt.penalty, 500);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.processor.calls(MockPaymentProcessor::CHARGE_FEE), 0);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 500);
    }

    #[tokio::test]
    async fn test_email_failure_does_not_fail_cancellation() {
        let h = harness();
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"));
        h.store.fail_on("enqueue");

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        assert!(matches!(outcome, CancellationOutcome::Cancelled(_)));
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_status_moved_after_refund_is_cancelled_from_current_status() {
        let h = shifting_harness(1);
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Confirmed, Some("pi_1"));

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        match outcome {
            CancellationOutcome::Cancelled(receipt) => {
                assert_eq!(receipt.penalty, 820);
                assert!(receipt.reconciliation_id.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.processor.refunds().len(), 1);
        assert_eq!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Cancelled);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 820);
        assert!(h.store.reconciliation_entries().is_empty());
    }

    #[tokio::test]
    async fn test_status_that_keeps_moving_after_refund_is_flagged() {
        let h = shifting_harness(usize::MAX);
        let fx = testing::seed_booking(&h.store, 10_000, BookingStatus::Confirmed, Some("pi_1"));

        let outcome = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await.unwrap();

        let receipt = match outcome {
            CancellationOutcome::Cancelled(receipt) => receipt,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(receipt.reconciliation_id.is_some());
        let entries = h.store.reconciliation_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ReconciliationKind::Refund);
        assert_eq!(entries[0].entity_id, fx.booking.id);
        assert_ne!(h.store.booking(fx.booking.id).unwrap().status, BookingStatus::Cancelled);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 0);
    }

    #[tokio::test]
    async fn test_status_race_without_refund_is_a_conflict() {
        let h = shifting_harness(usize::MAX);
        let fx = testing::seed_booking(&h.store, 4_000, BookingStatus::Confirmed, None);

        let result = h.service.cancel(&owner(&fx), fx.booking.id, REASON).await;

        assert!(matches!(result, Err(LedgerError::Conflict(_))));
        assert!(h.store.reconciliation_entries().is_empty());
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 0);
    }
}
