use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use clubhouse_shared::Masked;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Money;

/// Status enums are stored as lowercase text columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

// ============================================================================
// Bookings
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Paid,
    Cancelled,
}

text_enum!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Paid => "paid",
    Cancelled => "cancelled",
});

impl BookingStatus {
    /// Settled bookings count toward partner earnings.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Paid)
    }
}

/// Fee breakdown frozen on a booking at creation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingSnapshot {
    pub unit_amount: Money,
    pub quantity: u32,
    pub total_amount: Money,
    pub commission_bps: u32,
    pub platform_fee: Money,
    pub partner_earnings: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancellationRecord {
    pub cancelled_by: Uuid,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
    pub refund_id: Option<String>,
    pub processor_fee: Money,
    pub management_fee: Money,
    pub penalty: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub offer_id: Uuid,
    pub subscriber_id: Uuid,
    pub amount: Money,
    pub status: BookingStatus,
    pub pricing: PricingSnapshot,
    pub payment_intent_id: Option<String>,
    pub cancellation: Option<CancellationRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a booking; the snapshot is already computed.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub offer_id: Uuid,
    pub subscriber_id: Uuid,
    pub status: BookingStatus,
    pub pricing: PricingSnapshot,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A booking joined with everything the cancellation flow needs.
#[derive(Debug, Clone)]
pub struct BookingContext {
    pub booking: Booking,
    pub offer_title: String,
    pub partner: Partner,
    pub subscriber_email: Masked<String>,
    pub subscriber_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub title: String,
    pub base_price: Money,
    pub promo_price: Option<Money>,
    pub commission_bps: Option<u32>,
}

// ============================================================================
// Partners & payouts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub email: Masked<String>,
    pub connected_account_id: Option<String>,
    pub charges_enabled: bool,
    pub pending_penalties: Money,
}

/// Half-open billing window `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// The last calendar month that completed before `reference`.
    pub fn prior_month(reference: NaiveDate) -> Option<Self> {
        let end = reference.checked_sub_days(Days::new(u64::from(reference.day0())))?;
        let start = end.checked_sub_months(Months::new(1))?;
        Some(Self { start, end })
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.end.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start_at() && instant < self.end_at()
    }

    /// `2026-09` style label used in metadata and statements.
    pub fn label(&self) -> String {
        self.start.format("%Y-%m").to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Paid,
    Failed,
    /// Closed without a transfer: penalties absorbed the whole period's earnings.
    Settled,
}

text_enum!(PayoutStatus {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Settled => "settled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub period: BillingPeriod,
    pub gross_earnings: Money,
    pub penalties_applied: Money,
    pub booking_count: i64,
    pub net_amount: Money,
    pub status: PayoutStatus,
    pub transfer_id: Option<String>,
    /// Set before the first transfer request goes out. The amounts are frozen from then on.
    pub transfer_attempted_at: Option<DateTime<Utc>>,
    /// Bumped each time a failed payout is reopened, so the reopened transfer
    /// gets a fresh idempotency key.
    pub transfer_round: i32,
    pub statement_url: Option<String>,
    pub failure_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payout {
    pub fn is_transferable(&self) -> bool {
        self.status == PayoutStatus::Pending && self.net_amount > 0
    }

    /// Paid or settled; never rewritten again.
    pub fn is_closed(&self) -> bool {
        matches!(self.status, PayoutStatus::Paid | PayoutStatus::Settled)
    }

    pub fn transfer_idempotency_key(&self) -> String {
        format!("payout-{}-{}", self.id, self.transfer_round)
    }
}

/// Aggregated settled earnings for one partner over one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartnerEarnings {
    pub partner_id: Uuid,
    pub gross_earnings: Money,
    pub booking_count: i64,
}

#[derive(Debug, Clone)]
pub struct PayoutDraft {
    pub partner_id: Uuid,
    pub period: BillingPeriod,
    pub gross_earnings: Money,
    pub penalties_applied: Money,
    pub booking_count: i64,
    pub net_amount: Money,
}

/// Result of the (partner, period) keyed upsert.
#[derive(Debug, Clone)]
pub enum PayoutUpsert {
    Created(Payout),
    Updated(Payout),
    /// Paid or settled; left as it was.
    Closed(Payout),
    /// A transfer was already attempted; left as it was so a retry sends the same amount.
    InFlight(Payout),
}

impl PayoutUpsert {
    pub fn payout(&self) -> &Payout {
        match self {
            Self::Created(p) | Self::Updated(p) | Self::Closed(p) | Self::InFlight(p) => p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutStatement {
    pub payout_id: Uuid,
    pub partner_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

text_enum!(SubscriptionStatus {
    Incomplete => "incomplete",
    IncompleteExpired => "incomplete_expired",
    Trialing => "trialing",
    Active => "active",
    PastDue => "past_due",
    Canceled => "canceled",
    Unpaid => "unpaid",
    Paused => "paused",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub subscriber_email: Masked<String>,
    pub subscriber_name: Option<String>,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub welcome_sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Processor-authoritative fields copied onto the local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState {
            status: self.status,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
        }
    }
}

// ============================================================================
// Installments
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Failed,
}

text_enum!(InstallmentStatus {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstallment {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub sequence: i32,
    pub due_date: NaiveDate,
    pub amount: Money,
    pub status: InstallmentStatus,
}

/// A pending installment joined with its plan's subscriber.
#[derive(Debug, Clone)]
pub struct InstallmentDue {
    pub installment: PaymentInstallment,
    pub plan_description: String,
    pub installment_count: i32,
    pub subscriber_email: Masked<String>,
    pub subscriber_name: Option<String>,
}

// ============================================================================
// Wallet
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub partner_id: Uuid,
    pub amount: Money,
    pub balance_after: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DebitOutcome {
    Completed(WalletTransaction),
    InsufficientFunds { balance: Money, requested: Money },
}

// ============================================================================
// Notifications
// ============================================================================

/// One row of the insert-only email queue. Rows start out `pending`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_address: Masked<String>,
    pub subject: String,
    pub content: String,
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    Refund,
    Transfer,
}

text_enum!(ReconciliationKind {
    Refund => "refund",
    Transfer => "transfer",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Open,
    Resolved,
}

text_enum!(ReconciliationStatus {
    Open => "open",
    Resolved => "resolved",
});

/// The local write that should have followed a confirmed external action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum LocalEffect {
    CancelBooking {
        booking_id: Uuid,
        partner_id: Uuid,
        expected_status: BookingStatus,
        record: CancellationRecord,
    },
    MarkPayoutPaid {
        payout_id: Uuid,
        partner_id: Uuid,
        transfer_id: String,
        penalties_settled: Money,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReconciliationEntry {
    pub kind: ReconciliationKind,
    pub external_reference: String,
    pub entity_id: Uuid,
    pub effect: LocalEffect,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    pub id: Uuid,
    pub kind: ReconciliationKind,
    pub external_reference: String,
    pub entity_id: Uuid,
    pub effect: LocalEffect,
    pub status: ReconciliationStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
