use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{
    BillingPeriod, Booking, BookingContext, BookingStatus, CancellationRecord, DebitOutcome,
    EmailMessage, InstallmentDue, NewBooking, NewReconciliationEntry, Offer, Partner,
    PartnerEarnings, Payout, PayoutDraft, PayoutStatement, PayoutUpsert, ReconciliationEntry,
    Subscription, SubscriptionState,
};
use crate::Money;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Constraint violated: {0}")]
    Constraint(String),
    #[error("Storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Backend(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository trait for bookings and the offers they reference
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn get_offer(&self, offer_id: Uuid) -> StoreResult<Option<Offer>>;

    async fn insert_booking(&self, booking: &NewBooking) -> StoreResult<Booking>;

    async fn get_booking_context(&self, booking_id: Uuid) -> StoreResult<Option<BookingContext>>;

    /// Cancels the booking only if it is still in `expected` status, and in the
    /// same transaction adds `record.penalty` to the partner's pending penalties.
    /// Returns `false` when the status guard did not match.
    async fn record_cancellation(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        partner_id: Uuid,
        record: &CancellationRecord,
    ) -> StoreResult<bool>;

    /// Sum of partner earnings of settled bookings created inside the period.
    async fn settled_earnings(&self, period: &BillingPeriod) -> StoreResult<Vec<PartnerEarnings>>;
}

/// Repository trait for partner balances and onboarding state
#[async_trait]
pub trait PartnerRepository: Send + Sync {
    async fn get_partner(&self, partner_id: Uuid) -> StoreResult<Option<Partner>>;

    async fn partners_with_pending_penalties(&self) -> StoreResult<Vec<Partner>>;

    async fn set_charges_enabled(&self, partner_id: Uuid, enabled: bool) -> StoreResult<()>;
}

/// Repository trait for payouts and their statements
#[async_trait]
pub trait PayoutRepository: Send + Sync {
    /// Insert-or-update keyed on (partner, period). Closed rows and rows with a
    /// transfer attempt on record are left untouched; a failed row is reopened.
    async fn upsert_payout(&self, draft: &PayoutDraft) -> StoreResult<PayoutUpsert>;

    async fn get_payout(&self, payout_id: Uuid) -> StoreResult<Option<Payout>>;

    /// Penalties already applied by the partner's pending payouts for other periods.
    async fn committed_penalties(&self, partner_id: Uuid, period: &BillingPeriod) -> StoreResult<Money>;

    /// Every pending payout, oldest first, including zero-net ones awaiting settlement.
    async fn pending_payouts(&self) -> StoreResult<Vec<Payout>>;

    /// Stamps the transfer attempt on a pending payout and returns the frozen row,
    /// or `None` if it is no longer pending.
    async fn begin_transfer(&self, payout_id: Uuid) -> StoreResult<Option<Payout>>;

    /// Marks a pending payout paid and settles `penalties_settled` from the
    /// partner's pending penalties, atomically. Returns `false` if the payout
    /// was no longer pending.
    async fn mark_payout_paid(
        &self,
        payout_id: Uuid,
        partner_id: Uuid,
        transfer_id: &str,
        penalties_settled: Money,
    ) -> StoreResult<bool>;

    /// Closes a pending zero-net payout as settled and, in the same step,
    /// consumes its applied penalties. Returns `false` if the guard did not match.
    async fn settle_without_transfer(&self, payout_id: Uuid, partner_id: Uuid) -> StoreResult<bool>;

    /// Marks a pending payout failed and clears its transfer attempt.
    async fn mark_payout_failed(&self, payout_id: Uuid, note: &str) -> StoreResult<()>;

    /// Keeps the payout pending but records why the last attempt did not finish.
    async fn note_payout_attempt(&self, payout_id: Uuid, note: &str) -> StoreResult<()>;

    async fn set_statement_url(&self, payout_id: Uuid, url: &str) -> StoreResult<()>;

    async fn save_statement(&self, statement: &PayoutStatement) -> StoreResult<()>;

    async fn get_statement(&self, payout_id: Uuid) -> StoreResult<Option<PayoutStatement>>;
}

/// Repository trait for locally mirrored processor subscriptions
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Subscription>>;

    async fn update_state(&self, subscription_id: Uuid, state: &SubscriptionState) -> StoreResult<()>;

    /// Sets the welcome marker if unset. Returns `true` only for the caller that set it.
    async fn claim_welcome(&self, subscription_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait InstallmentRepository: Send + Sync {
    async fn pending_due_on(&self, due_date: NaiveDate) -> StoreResult<Vec<InstallmentDue>>;
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Checks the balance and, if sufficient, debits it and records the
    /// transaction in one all-or-nothing step.
    async fn debit(&self, user_id: Uuid, partner_id: Uuid, amount: Money) -> StoreResult<DebitOutcome>;
}

/// Insert-only email queue drained by an external sender.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, message: &EmailMessage) -> StoreResult<Uuid>;
}

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn record_entry(&self, entry: &NewReconciliationEntry) -> StoreResult<ReconciliationEntry>;

    async fn open_entries(&self, limit: i64) -> StoreResult<Vec<ReconciliationEntry>>;

    async fn mark_resolved(&self, entry_id: Uuid) -> StoreResult<()>;

    async fn record_attempt(&self, entry_id: Uuid, error: &str) -> StoreResult<()>;
}
