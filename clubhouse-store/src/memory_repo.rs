//! Process-local store with the same guards as the Postgres repositories.
//!
//! Backs local runs without a database and every service test. Failures can be
//! injected per operation name to exercise the partial-failure paths.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use clubhouse_core::models::{
    BillingPeriod, Booking, BookingContext, BookingStatus, CancellationRecord, DebitOutcome,
    EmailMessage, InstallmentDue, InstallmentStatus, NewBooking, NewReconciliationEntry, Offer,
    Partner, PartnerEarnings, Payout, PayoutDraft, PayoutStatement, PayoutStatus, PayoutUpsert,
    ReconciliationEntry, ReconciliationStatus, Subscription, SubscriptionState, WalletTransaction,
};
use clubhouse_core::repository::{
    BookingRepository, InstallmentRepository, NotificationQueue, PartnerRepository,
    PayoutRepository, ReconciliationRepository, SubscriptionRepository, WalletRepository,
};
use clubhouse_core::{Money, StoreError, StoreResult};
use clubhouse_shared::Masked;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct Subscriber {
    email: String,
    name: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    partners: HashMap<Uuid, Partner>,
    offers: HashMap<Uuid, Offer>,
    subscribers: HashMap<Uuid, Subscriber>,
    bookings: HashMap<Uuid, Booking>,
    payouts: Vec<Payout>,
    statements: HashMap<Uuid, PayoutStatement>,
    subscriptions: HashMap<Uuid, Subscription>,
    installments: Vec<InstallmentDue>,
    wallets: HashMap<(Uuid, Uuid), Money>,
    wallet_transactions: Vec<WalletTransaction>,
    emails: Vec<EmailMessage>,
    reconciliation: Vec<ReconciliationEntry>,
    failing: HashSet<&'static str>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks the state unless `operation` has been told to fail.
    fn enter(&self, operation: &'static str) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.failing.contains(operation) {
            return Err(StoreError::backend(format!("injected failure in {}", operation)));
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn seed_partner(&self, partner: Partner) {
        self.state().partners.insert(partner.id, partner);
    }

    pub fn seed_offer(&self, offer: Offer) {
        self.state().offers.insert(offer.id, offer);
    }

    pub fn seed_subscriber(&self, user_id: Uuid, email: &str, name: Option<&str>) {
        self.state().subscribers.insert(
            user_id,
            Subscriber {
                email: email.to_string(),
                name: name.map(str::to_string),
            },
        );
    }

    pub fn seed_booking(&self, booking: Booking) {
        self.state().bookings.insert(booking.id, booking);
    }

    pub fn seed_payout(&self, payout: Payout) {
        self.state().payouts.push(payout);
    }

    pub fn seed_statement(&self, statement: PayoutStatement) {
        self.state().statements.insert(statement.payout_id, statement);
    }

    pub fn seed_subscription(&self, subscription: Subscription) {
        self.state().subscriptions.insert(subscription.id, subscription);
    }

    pub fn seed_installment(&self, installment: InstallmentDue) {
        self.state().installments.push(installment);
    }

    pub fn seed_wallet(&self, user_id: Uuid, partner_id: Uuid, balance: Money) {
        self.state().wallets.insert((user_id, partner_id), balance);
    }

    pub fn set_pending_penalties(&self, partner_id: Uuid, amount: Money) {
        if let Some(partner) = self.state().partners.get_mut(&partner_id) {
            partner.pending_penalties = amount;
        }
    }

    /// Every call to `operation` fails until [`Self::clear_failures`].
    pub fn fail_on(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn booking(&self, booking_id: Uuid) -> Option<Booking> {
        self.state().bookings.get(&booking_id).cloned()
    }

    pub fn partner(&self, partner_id: Uuid) -> Option<Partner> {
        self.state().partners.get(&partner_id).cloned()
    }

    pub fn payout(&self, payout_id: Uuid) -> Option<Payout> {
        self.state().payouts.iter().find(|p| p.id == payout_id).cloned()
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.state().payouts.clone()
    }

    pub fn statement(&self, payout_id: Uuid) -> Option<PayoutStatement> {
        self.state().statements.get(&payout_id).cloned()
    }

    pub fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.state().subscriptions.get(&subscription_id).cloned()
    }

    pub fn wallet_balance(&self, user_id: Uuid, partner_id: Uuid) -> Option<Money> {
        self.state().wallets.get(&(user_id, partner_id)).copied()
    }

    pub fn wallet_transactions(&self) -> Vec<WalletTransaction> {
        self.state().wallet_transactions.clone()
    }

    pub fn emails(&self) -> Vec<EmailMessage> {
        self.state().emails.clone()
    }

    pub fn reconciliation_entries(&self) -> Vec<ReconciliationEntry> {
        self.state().reconciliation.clone()
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn get_offer(&self, offer_id: Uuid) -> StoreResult<Option<Offer>> {
        Ok(self.enter("get_offer")?.offers.get(&offer_id).cloned())
    }

    async fn insert_booking(&self, booking: &NewBooking) -> StoreResult<Booking> {
        let mut state = self.enter("insert_booking")?;
        if state.bookings.contains_key(&booking.id) {
            return Err(StoreError::Constraint(format!("duplicate booking {}", booking.id)));
        }
        let stored = Booking {
            id: booking.id,
            partner_id: booking.partner_id,
            offer_id: booking.offer_id,
            subscriber_id: booking.subscriber_id,
            amount: booking.pricing.total_amount,
            status: booking.status,
            pricing: booking.pricing,
            payment_intent_id: booking.payment_intent_id.clone(),
            cancellation: None,
            created_at: booking.created_at,
            updated_at: booking.created_at,
        };
        state.bookings.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_booking_context(&self, booking_id: Uuid) -> StoreResult<Option<BookingContext>> {
        let state = self.enter("get_booking_context")?;
        let Some(booking) = state.bookings.get(&booking_id) else {
            return Ok(None);
        };
        let (Some(offer), Some(partner), Some(subscriber)) = (
            state.offers.get(&booking.offer_id),
            state.partners.get(&booking.partner_id),
            state.subscribers.get(&booking.subscriber_id),
        ) else {
            return Ok(None);
        };
        Ok(Some(BookingContext {
            booking: booking.clone(),
            offer_title: offer.title.clone(),
            partner: partner.clone(),
            subscriber_email: Masked(subscriber.email.clone()),
            subscriber_name: subscriber.name.clone(),
        }))
    }

    async fn record_cancellation(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        partner_id: Uuid,
        record: &CancellationRecord,
    ) -> StoreResult<bool> {
        let mut state = self.enter("record_cancellation")?;
        if !state.partners.contains_key(&partner_id) {
            return Err(StoreError::NotFound(format!("partner {}", partner_id)));
        }
        match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == expected => {
                booking.status = BookingStatus::Cancelled;
                booking.cancellation = Some(record.clone());
                booking.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        if let Some(partner) = state.partners.get_mut(&partner_id) {
            partner.pending_penalties += record.penalty;
        }
        Ok(true)
    }

    async fn settled_earnings(&self, period: &BillingPeriod) -> StoreResult<Vec<PartnerEarnings>> {
        let state = self.enter("settled_earnings")?;
        let mut totals: BTreeMap<Uuid, (Money, i64)> = BTreeMap::new();
        for booking in state.bookings.values() {
            if booking.status.is_settled() && period.contains(booking.created_at) {
                let entry = totals.entry(booking.partner_id).or_insert((0, 0));
                entry.0 += booking.pricing.partner_earnings;
                entry.1 += 1;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(partner_id, (gross_earnings, booking_count))| PartnerEarnings {
                partner_id,
                gross_earnings,
                booking_count,
            })
            .collect())
    }
}

#[async_trait]
impl PartnerRepository for InMemoryStore {
    async fn get_partner(&self, partner_id: Uuid) -> StoreResult<Option<Partner>> {
        Ok(self.enter("get_partner")?.partners.get(&partner_id).cloned())
    }

    async fn partners_with_pending_penalties(&self) -> StoreResult<Vec<Partner>> {
        let state = self.enter("partners_with_pending_penalties")?;
        let mut partners: Vec<Partner> = state
            .partners
            .values()
            .filter(|p| p.pending_penalties > 0)
            .cloned()
            .collect();
        partners.sort_by_key(|p| p.id);
        Ok(partners)
    }

    async fn set_charges_enabled(&self, partner_id: Uuid, enabled: bool) -> StoreResult<()> {
        let mut state = self.enter("set_charges_enabled")?;
        let partner = state
            .partners
            .get_mut(&partner_id)
            .ok_or_else(|| StoreError::NotFound(format!("partner {}", partner_id)))?;
        partner.charges_enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn upsert_payout(&self, draft: &PayoutDraft) -> StoreResult<PayoutUpsert> {
        let mut state = self.enter("upsert_payout")?;
        let now = Utc::now();
        let existing = state
            .payouts
            .iter_mut()
            .find(|p| p.partner_id == draft.partner_id && p.period == draft.period);

        match existing {
            Some(payout) if payout.is_closed() => Ok(PayoutUpsert::Closed(payout.clone())),
            Some(payout) if payout.transfer_attempted_at.is_some() => Ok(PayoutUpsert::InFlight(payout.clone())),
            Some(payout) => {
                if payout.status == PayoutStatus::Failed {
                    payout.transfer_round += 1;
                }
                payout.gross_earnings = draft.gross_earnings;
                payout.penalties_applied = draft.penalties_applied;
                payout.booking_count = draft.booking_count;
                payout.net_amount = draft.net_amount;
                payout.status = PayoutStatus::Pending;
                payout.failure_note = None;
                payout.updated_at = now;
                Ok(PayoutUpsert::Updated(payout.clone()))
            }
            None => {
                let payout = Payout {
                    id: Uuid::new_v4(),
                    partner_id: draft.partner_id,
                    period: draft.period,
                    gross_earnings: draft.gross_earnings,
                    penalties_applied: draft.penalties_applied,
                    booking_count: draft.booking_count,
                    net_amount: draft.net_amount,
                    status: PayoutStatus::Pending,
                    transfer_id: None,
                    transfer_attempted_at: None,
                    transfer_round: 0,
                    statement_url: None,
                    failure_note: None,
                    created_at: now,
                    updated_at: now,
                    paid_at: None,
                };
                state.payouts.push(payout.clone());
                Ok(PayoutUpsert::Created(payout))
            }
        }
    }

    async fn get_payout(&self, payout_id: Uuid) -> StoreResult<Option<Payout>> {
        let state = self.enter("get_payout")?;
        Ok(state.payouts.iter().find(|p| p.id == payout_id).cloned())
    }

    async fn committed_penalties(&self, partner_id: Uuid, period: &BillingPeriod) -> StoreResult<Money> {
        let state = self.enter("committed_penalties")?;
        Ok(state
            .payouts
            .iter()
            .filter(|p| p.partner_id == partner_id && p.status == PayoutStatus::Pending && p.period != *period)
            .map(|p| p.penalties_applied)
            .sum())
    }

    async fn pending_payouts(&self) -> StoreResult<Vec<Payout>> {
        let state = self.enter("pending_payouts")?;
        let mut pending: Vec<Payout> = state
            .payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        Ok(pending)
    }

    async fn begin_transfer(&self, payout_id: Uuid) -> StoreResult<Option<Payout>> {
        let mut state = self.enter("begin_transfer")?;
        let now = Utc::now();
        Ok(state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id && p.status == PayoutStatus::Pending)
            .map(|payout| {
                if payout.transfer_attempted_at.is_none() {
                    payout.transfer_attempted_at = Some(now);
                    payout.updated_at = now;
                }
                payout.clone()
            }))
    }

    async fn mark_payout_paid(
        &self,
        payout_id: Uuid,
        partner_id: Uuid,
        transfer_id: &str,
        penalties_settled: Money,
    ) -> StoreResult<bool> {
        let mut state = self.enter("mark_payout_paid")?;
        let now = Utc::now();
        match state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id && p.status == PayoutStatus::Pending)
        {
            Some(payout) => {
                payout.status = PayoutStatus::Paid;
                payout.transfer_id = Some(transfer_id.to_string());
                payout.paid_at = Some(now);
                payout.failure_note = None;
                payout.updated_at = now;
            }
            None => return Ok(false),
        }
        if penalties_settled > 0 {
            if let Some(partner) = state.partners.get_mut(&partner_id) {
                partner.pending_penalties = (partner.pending_penalties - penalties_settled).max(0);
            }
        }
        Ok(true)
    }

    async fn settle_without_transfer(&self, payout_id: Uuid, partner_id: Uuid) -> StoreResult<bool> {
        let mut state = self.enter("settle_without_transfer")?;
        let now = Utc::now();
        let settled = match state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id && p.status == PayoutStatus::Pending && p.net_amount <= 0)
        {
            Some(payout) => {
                payout.status = PayoutStatus::Settled;
                payout.paid_at = Some(now);
                payout.failure_note = None;
                payout.updated_at = now;
                payout.penalties_applied
            }
            None => return Ok(false),
        };
        if settled > 0 {
            if let Some(partner) = state.partners.get_mut(&partner_id) {
                partner.pending_penalties = (partner.pending_penalties - settled).max(0);
            }
        }
        Ok(true)
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, note: &str) -> StoreResult<()> {
        let mut state = self.enter("mark_payout_failed")?;
        let payout = state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id && p.status == PayoutStatus::Pending)
            .ok_or_else(|| StoreError::NotFound(format!("pending payout {}", payout_id)))?;
        payout.status = PayoutStatus::Failed;
        payout.transfer_attempted_at = None;
        payout.failure_note = Some(note.to_string());
        payout.updated_at = Utc::now();
        Ok(())
    }

    async fn note_payout_attempt(&self, payout_id: Uuid, note: &str) -> StoreResult<()> {
        let mut state = self.enter("note_payout_attempt")?;
        if let Some(payout) = state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id && p.status == PayoutStatus::Pending)
        {
            payout.failure_note = Some(note.to_string());
            payout.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_statement_url(&self, payout_id: Uuid, url: &str) -> StoreResult<()> {
        let mut state = self.enter("set_statement_url")?;
        if let Some(payout) = state.payouts.iter_mut().find(|p| p.id == payout_id) {
            payout.statement_url = Some(url.to_string());
            payout.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn save_statement(&self, statement: &PayoutStatement) -> StoreResult<()> {
        self.enter("save_statement")?
            .statements
            .insert(statement.payout_id, statement.clone());
        Ok(())
    }

    async fn get_statement(&self, payout_id: Uuid) -> StoreResult<Option<PayoutStatement>> {
        Ok(self.enter("get_statement")?.statements.get(&payout_id).cloned())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Subscription>> {
        let state = self.enter("find_by_external_id")?;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id == external_id)
            .cloned())
    }

    async fn update_state(&self, subscription_id: Uuid, new_state: &SubscriptionState) -> StoreResult<()> {
        let mut state = self.enter("update_state")?;
        let subscription = state
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", subscription_id)))?;
        subscription.status = new_state.status;
        subscription.current_period_end = new_state.current_period_end;
        subscription.cancel_at_period_end = new_state.cancel_at_period_end;
        subscription.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_welcome(&self, subscription_id: Uuid) -> StoreResult<bool> {
        let mut state = self.enter("claim_welcome")?;
        match state.subscriptions.get_mut(&subscription_id) {
            Some(subscription) if subscription.welcome_sent_at.is_none() => {
                subscription.welcome_sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl InstallmentRepository for InMemoryStore {
    async fn pending_due_on(&self, due_date: NaiveDate) -> StoreResult<Vec<InstallmentDue>> {
        let state = self.enter("pending_due_on")?;
        Ok(state
            .installments
            .iter()
            .filter(|i| i.installment.status == InstallmentStatus::Pending && i.installment.due_date == due_date)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WalletRepository for InMemoryStore {
    async fn debit(&self, user_id: Uuid, partner_id: Uuid, amount: Money) -> StoreResult<DebitOutcome> {
        let mut state = self.enter("debit")?;
        if !state.partners.contains_key(&partner_id) {
            return Err(StoreError::NotFound(format!("partner {}", partner_id)));
        }
        let balance = state.wallets.get(&(user_id, partner_id)).copied().unwrap_or(0);
        if balance < amount {
            return Ok(DebitOutcome::InsufficientFunds {
                balance,
                requested: amount,
            });
        }

        let balance_after = balance - amount;
        state.wallets.insert((user_id, partner_id), balance_after);
        let transaction = WalletTransaction {
            id: Uuid::new_v4(),
            user_id,
            partner_id,
            amount,
            balance_after,
            created_at: Utc::now(),
        };
        state.wallet_transactions.push(transaction.clone());
        Ok(DebitOutcome::Completed(transaction))
    }
}

#[async_trait]
impl NotificationQueue for InMemoryStore {
    async fn enqueue(&self, message: &EmailMessage) -> StoreResult<Uuid> {
        self.enter("enqueue")?.emails.push(message.clone());
        Ok(Uuid::new_v4())
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryStore {
    async fn record_entry(&self, entry: &NewReconciliationEntry) -> StoreResult<ReconciliationEntry> {
        let mut state = self.enter("record_entry")?;
        let stored = ReconciliationEntry {
            id: Uuid::new_v4(),
            kind: entry.kind,
            external_reference: entry.external_reference.clone(),
            entity_id: entry.entity_id,
            effect: entry.effect.clone(),
            status: ReconciliationStatus::Open,
            attempts: 0,
            last_error: entry.last_error.clone(),
            created_at: Utc::now(),
            resolved_at: None,
        };
        state.reconciliation.push(stored.clone());
        Ok(stored)
    }

    async fn open_entries(&self, limit: i64) -> StoreResult<Vec<ReconciliationEntry>> {
        let state = self.enter("open_entries")?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .reconciliation
            .iter()
            .filter(|e| e.status == ReconciliationStatus::Open)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, entry_id: Uuid) -> StoreResult<()> {
        let mut state = self.enter("mark_resolved")?;
        if let Some(entry) = state.reconciliation.iter_mut().find(|e| e.id == entry_id) {
            entry.status = ReconciliationStatus::Resolved;
            entry.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_attempt(&self, entry_id: Uuid, error: &str) -> StoreResult<()> {
        let mut state = self.enter("record_attempt")?;
        if let Some(entry) = state.reconciliation.iter_mut().find(|e| e.id == entry_id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
