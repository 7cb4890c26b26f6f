use chrono::Utc;
use clubhouse_core::models::{
    LocalEffect, NewReconciliationEntry, Partner, Payout, PayoutStatement, ReconciliationKind,
};
use clubhouse_core::payment::{PaymentProcessor, TransferRequest};
use clubhouse_core::repository::{PartnerRepository, PayoutRepository, ReconciliationRepository};
use clubhouse_core::LedgerResult;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notifications::Notifier;
use crate::reconciliation;
use crate::retry::RetryPolicy;
use crate::statement::StatementRenderer;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub currency: String,
    pub concurrency: usize,
    pub statement_base_url: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExecutionReport {
    pub examined: usize,
    pub paid: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending_retry: usize,
    /// Zero-net payouts closed against penalties without a transfer.
    pub settled: usize,
    /// Transfers that went out but could not be recorded locally.
    pub flagged: usize,
}

#[derive(Debug)]
enum Settlement {
    Paid { flagged: bool },
    Offset,
    Skipped(&'static str),
    Failed(String),
    Deferred(String),
}

/// Moves pending payouts to partners' connected accounts. Each payout is
/// handled on its own; one partner's failure never stops the batch.
pub struct TransferExecutor {
    partners: Arc<dyn PartnerRepository>,
    payouts: Arc<dyn PayoutRepository>,
    reconciliation: Arc<dyn ReconciliationRepository>,
    processor: Arc<dyn PaymentProcessor>,
    statements: Arc<dyn StatementRenderer>,
    notifier: Notifier,
    retry: RetryPolicy,
    settings: TransferSettings,
}

impl TransferExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partners: Arc<dyn PartnerRepository>,
        payouts: Arc<dyn PayoutRepository>,
        reconciliation: Arc<dyn ReconciliationRepository>,
        processor: Arc<dyn PaymentProcessor>,
        statements: Arc<dyn StatementRenderer>,
        notifier: Notifier,
        retry: RetryPolicy,
        settings: TransferSettings,
    ) -> Self {
        Self {
            partners,
            payouts,
            reconciliation,
            processor,
            statements,
            notifier,
            retry,
            settings,
        }
    }

    pub fn statement_url(&self, payout_id: Uuid) -> String {
        format!(
            "{}/v1/statements/{}",
            self.settings.statement_base_url.trim_end_matches('/'),
            payout_id
        )
    }

    pub async fn execute(&self) -> LedgerResult<ExecutionReport> {
        let pending = self.payouts.pending_payouts().await?;
        let mut report = ExecutionReport {
            examined: pending.len(),
            ..ExecutionReport::default()
        };
        info!(payouts = pending.len(), "Executing payout transfers");

        let outcomes: Vec<(Uuid, Settlement)> = stream::iter(pending)
            .map(|payout| async move {
                let payout_id = payout.id;
                (payout_id, self.settle(payout).await)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (payout_id, outcome) in outcomes {
            match outcome {
                Settlement::Paid { flagged } => {
                    report.paid += 1;
                    if flagged {
                        report.flagged += 1;
                    }
                }
                Settlement::Offset => report.settled += 1,
                Settlement::Skipped(reason) => {
                    info!(%payout_id, reason, "Payout skipped");
                    report.skipped += 1;
                }
                Settlement::Failed(note) => {
                    warn!(%payout_id, note = %note, "Payout failed");
                    report.failed += 1;
                }
                Settlement::Deferred(note) => {
                    warn!(%payout_id, note = %note, "Payout left pending for retry");
                    report.pending_retry += 1;
                }
            }
        }

        info!(
            paid = report.paid,
            skipped = report.skipped,
            failed = report.failed,
            pending_retry = report.pending_retry,
            settled = report.settled,
            flagged = report.flagged,
            "Payout transfers finished"
        );
        Ok(report)
    }

    async fn settle(&self, payout: Payout) -> Settlement {
        if payout.net_amount <= 0 {
            return self.offset(&payout).await;
        }

        let partner = match self.partners.get_partner(payout.partner_id).await {
            Ok(Some(partner)) => partner,
            Ok(None) => return self.fail(&payout, "partner record missing".to_string()).await,
            Err(e) => return self.defer(&payout, format!("could not load partner: {}", e)).await,
        };
        let Some(account_id) = partner.connected_account_id.clone() else {
            return Settlement::Skipped("no connected account");
        };

        let processor = self.processor.as_ref();
        let account_ref = account_id.as_str();
        let account = match self
            .retry
            .run("retrieve_account", move || processor.retrieve_account(account_ref))
            .await
        {
            Ok(account) => account,
            Err(e) => return self.defer(&payout, format!("account lookup failed: {}", e)).await,
        };
        if account.charges_enabled != partner.charges_enabled {
            info!(partner_id = %partner.id, charges_enabled = account.charges_enabled, "Connected account status changed");
            if let Err(e) = self.partners.set_charges_enabled(partner.id, account.charges_enabled).await {
                warn!(partner_id = %partner.id, error = %e, "Could not update charges_enabled");
            }
        }
        if !account.charges_enabled {
            return Settlement::Skipped("connected account cannot receive funds");
        }

        // Amounts are frozen from here; regeneration leaves an attempted payout alone.
        let payout = match self.payouts.begin_transfer(payout.id).await {
            Ok(Some(frozen)) => frozen,
            Ok(None) => return Settlement::Skipped("no longer pending"),
            Err(e) => return self.defer(&payout, format!("could not start transfer: {}", e)).await,
        };
        if payout.net_amount <= 0 {
            return self.offset(&payout).await;
        }

        let statement_url = self.publish_statement(&payout, &partner).await;

        let mut metadata = BTreeMap::new();
        metadata.insert("payout_id".to_string(), payout.id.to_string());
        metadata.insert("partner_id".to_string(), partner.id.to_string());
        metadata.insert("period".to_string(), payout.period.label());
        let request = TransferRequest {
            amount: payout.net_amount,
            currency: self.settings.currency.clone(),
            destination: account_id,
            idempotency_key: payout.transfer_idempotency_key(),
            metadata,
        };

        let request_ref = &request;
        let transfer = match self
            .retry
            .run("create_transfer", move || processor.create_transfer(request_ref))
            .await
        {
            Ok(transfer) => transfer,
            Err(e) if e.is_unknown_outcome() || e.is_retryable() => {
                // Same amount and idempotency key next run, so a transfer that did land is not repeated.
                return self.defer(&payout, format!("transfer not confirmed: {}", e)).await;
            }
            Err(e) => return self.fail(&payout, format!("transfer rejected: {}", e)).await,
        };

        let flagged = match self
            .payouts
            .mark_payout_paid(payout.id, partner.id, &transfer.id, payout.penalties_applied)
            .await
        {
            Ok(true) => {
                info!(
                    payout_id = %payout.id,
                    partner_id = %partner.id,
                    transfer_id = %transfer.id,
                    amount = payout.net_amount,
                    "Payout transferred"
                );
                false
            }
            Ok(false) => {
                warn!(payout_id = %payout.id, transfer_id = %transfer.id, "Payout was already settled by another run");
                false
            }
            Err(e) => {
                error!(
                    payout_id = %payout.id,
                    transfer_id = %transfer.id,
                    error = %e,
                    "PARTIAL FAILURE: transfer sent but payout not marked paid"
                );
                reconciliation::flag(
                    self.reconciliation.as_ref(),
                    NewReconciliationEntry {
                        kind: ReconciliationKind::Transfer,
                        external_reference: transfer.id.clone(),
                        entity_id: payout.id,
                        effect: LocalEffect::MarkPayoutPaid {
                            payout_id: payout.id,
                            partner_id: partner.id,
                            transfer_id: transfer.id.clone(),
                            penalties_settled: payout.penalties_applied,
                        },
                        last_error: Some(e.to_string()),
                    },
                )
                .await;
                true
            }
        };

        self.notifier
            .deliver(
                self.notifier.payout_sent(&partner, &payout, statement_url.as_deref()),
                "payout_sent",
            )
            .await;

        Settlement::Paid { flagged }
    }

    /// Closes a zero-net payout: its applied penalties are consumed, nothing is sent.
    async fn offset(&self, payout: &Payout) -> Settlement {
        match self.payouts.settle_without_transfer(payout.id, payout.partner_id).await {
            Ok(true) => {
                info!(
                    payout_id = %payout.id,
                    partner_id = %payout.partner_id,
                    penalties_settled = payout.penalties_applied,
                    "Payout settled against penalties"
                );
                Settlement::Offset
            }
            Ok(false) => Settlement::Skipped("no longer pending"),
            Err(e) => self.defer(payout, format!("could not settle zero payout: {}", e)).await,
        }
    }

    /// Stores the rendered statement and links it from the payout. Best effort.
    async fn publish_statement(&self, payout: &Payout, partner: &Partner) -> Option<String> {
        let statement = PayoutStatement {
            payout_id: payout.id,
            partner_id: partner.id,
            content: self.statements.render(payout, partner),
            created_at: Utc::now(),
        };
        if let Err(e) = self.payouts.save_statement(&statement).await {
            warn!(payout_id = %payout.id, error = %e, "Could not store payout statement");
            return None;
        }
        let url = self.statement_url(payout.id);
        if let Err(e) = self.payouts.set_statement_url(payout.id, &url).await {
            warn!(payout_id = %payout.id, error = %e, "Could not link payout statement");
        }
        Some(url)
    }

    async fn fail(&self, payout: &Payout, note: String) -> Settlement {
        if let Err(e) = self.payouts.mark_payout_failed(payout.id, &note).await {
            error!(payout_id = %payout.id, error = %e, "Could not mark payout failed");
        }
        Settlement::Failed(note)
    }

    async fn defer(&self, payout: &Payout, note: String) -> Settlement {
        if let Err(e) = self.payouts.note_payout_attempt(payout.id, &note).await {
            warn!(payout_id = %payout.id, error = %e, "Could not record payout attempt");
        }
        Settlement::Deferred(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payout::PayoutGenerator;
    use crate::statement::PlainTextStatement;
    use crate::testing;
    use chrono::{DateTime, NaiveDate};
    use clubhouse_core::models::{BookingStatus, PayoutStatus, ReconciliationStatus};
    use clubhouse_core::payment::ConnectedAccount;
    use clubhouse_core::{MockPaymentProcessor, ProcessorError};
    use clubhouse_store::InMemoryStore;

    struct Harness {
        store: Arc<InMemoryStore>,
        processor: Arc<MockPaymentProcessor>,
        executor: TransferExecutor,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let executor = TransferExecutor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            processor.clone(),
            Arc::new(PlainTextStatement::new("eur")),
            Notifier::new(store.clone(), "eur"),
            RetryPolicy::no_retry(),
            TransferSettings {
                currency: "eur".to_string(),
                concurrency: 4,
                statement_base_url: "https://club.example/".to_string(),
            },
        );
        Harness {
            store,
            processor,
            executor,
        }
    }

    /// A connected partner with a pending payout of `net`.
    fn pending_payout(h: &Harness, net: i64, penalties: i64) -> (Partner, Payout) {
        let partner = testing::partner(Uuid::new_v4());
        h.store.seed_partner(partner.clone());
        h.store.set_pending_penalties(partner.id, penalties);
        let account_id = partner.connected_account_id.clone().unwrap();
        h.processor.add_account(ConnectedAccount {
            id: account_id,
            charges_enabled: true,
            payouts_enabled: true,
        });
        let payout = testing::payout(partner.id, net + penalties, penalties);
        h.store.seed_payout(payout.clone());
        (partner, payout)
    }

    #[tokio::test]
    async fn test_transfer_marks_paid_and_settles_penalties() {
        let h = harness();
        let (partner, payout) = pending_payout(&h, 11_180, 820);

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.paid, 1);
        let transfers = h.processor.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 11_180);
        assert_eq!(transfers[0].idempotency_key, payout.transfer_idempotency_key());
        assert_eq!(transfers[0].metadata.get("period"), Some(&payout.period.label()));

        let stored = h.store.payout(payout.id).unwrap();
        assert_eq!(stored.status, PayoutStatus::Paid);
        assert!(stored.transfer_id.is_some());
        assert!(stored.transfer_attempted_at.is_some());
        assert_eq!(
            stored.statement_url.as_deref(),
            Some(format!("https://club.example/v1/statements/{}", payout.id).as_str())
        );
        assert_eq!(h.store.partner(partner.id).unwrap().pending_penalties, 0);
        assert_eq!(h.store.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_does_not_transfer_again() {
        let h = harness();
        pending_payout(&h, 5_000, 0);

        h.executor.execute().await.unwrap();
        let again = h.executor.execute().await.unwrap();

        assert_eq!(again.examined, 0);
        assert_eq!(h.processor.calls(MockPaymentProcessor::CREATE_TRANSFER), 1);
    }

    #[tokio::test]
    async fn test_partner_without_account_is_skipped() {
        let h = harness();
        let mut partner = testing::partner(Uuid::new_v4());
        partner.connected_account_id = None;
        h.store.seed_partner(partner.clone());
        let payout = testing::payout(partner.id, 5_000, 0);
        h.store.seed_payout(payout.clone());

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(h.store.payout(payout.id).unwrap().status, PayoutStatus::Pending);
        assert!(h.processor.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_account_is_skipped_and_recorded() {
        let h = harness();
        let (partner, payout) = pending_payout(&h, 5_000, 0);
        h.processor.add_account(ConnectedAccount {
            id: partner.connected_account_id.clone().unwrap(),
            charges_enabled: false,
            payouts_enabled: false,
        });

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert!(!h.store.partner(partner.id).unwrap().charges_enabled);
        assert_eq!(h.store.payout(payout.id).unwrap().status, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejected_transfer_marks_failed() {
        let h = harness();
        let (partner, payout) = pending_payout(&h, 5_000, 300);
        h.processor.fail_next(
            MockPaymentProcessor::CREATE_TRANSFER,
            ProcessorError::Api {
                status: 400,
                code: Some("insufficient_funds".to_string()),
                message: "platform balance too low".to_string(),
            },
        );

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.failed, 1);
        let stored = h.store.payout(payout.id).unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert!(stored.transfer_attempted_at.is_none());
        assert!(stored.failure_note.unwrap().contains("rejected"));
        assert_eq!(h.store.partner(partner.id).unwrap().pending_penalties, 300);
    }

    #[tokio::test]
    async fn test_timeout_keeps_payout_pending() {
        let h = harness();
        let (_, payout) = pending_payout(&h, 5_000, 0);
        h.processor
            .fail_after_apply(MockPaymentProcessor::CREATE_TRANSFER, ProcessorError::Timeout);

        let report = h.executor.execute().await.unwrap();
        assert_eq!(report.pending_retry, 1);
        assert_eq!(h.store.payout(payout.id).unwrap().status, PayoutStatus::Pending);

        // The retry reuses the idempotency key and finds the transfer that landed.
        let report = h.executor.execute().await.unwrap();
        assert_eq!(report.paid, 1);
        assert_eq!(h.processor.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_local_failure_after_transfer_is_flagged() {
        let h = harness();
        let (_, payout) = pending_payout(&h, 5_000, 0);
        h.store.fail_on("mark_payout_paid");

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.paid, 1);
        assert_eq!(report.flagged, 1);
        let entries = h.store.reconciliation_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ReconciliationKind::Transfer);
        assert_eq!(entries[0].entity_id, payout.id);
        assert_eq!(entries[0].status, ReconciliationStatus::Open);
    }

    #[tokio::test]
    async fn test_zero_payout_is_settled_without_transfer() {
        let h = harness();
        let partner = testing::partner(Uuid::new_v4());
        h.store.seed_partner(partner.clone());
        h.store.set_pending_penalties(partner.id, 820);
        let payout = testing::payout(partner.id, 400, 400);
        h.store.seed_payout(payout.clone());

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.settled, 1);
        assert!(h.processor.transfers().is_empty());
        assert_eq!(h.store.payout(payout.id).unwrap().status, PayoutStatus::Settled);
        assert_eq!(h.store.partner(partner.id).unwrap().pending_penalties, 420);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let h = harness();
        pending_payout(&h, 5_000, 0);
        pending_payout(&h, 7_000, 0);
        h.processor
            .fail_next(MockPaymentProcessor::RETRIEVE_ACCOUNT, ProcessorError::Network("reset".to_string()));

        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.paid, 1);
        assert_eq!(report.pending_retry, 1);
    }

    fn generator(h: &Harness) -> PayoutGenerator {
        PayoutGenerator::new(h.store.clone(), h.store.clone(), h.store.clone())
    }

    fn on(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, month, day).unwrap()
    }

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        on(month, day).and_hms_opt(10, 0, 0).unwrap().and_utc()
    }

    fn connect(h: &Harness, partner: &Partner) {
        h.processor.add_account(ConnectedAccount {
            id: partner.connected_account_id.clone().unwrap(),
            charges_enabled: true,
            payouts_enabled: true,
        });
    }

    /// Money sent equals the net recorded on paid payouts, and the penalties
    /// consumed equal the penalties those payouts and settled ones applied.
    fn assert_ledger_balanced(h: &Harness, partner: &Partner, penalties_before: i64) {
        let payouts = h.store.payouts();
        let sent: i64 = h.processor.transfers().iter().map(|t| t.amount).sum();
        let recorded: i64 = payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Paid)
            .map(|p| p.net_amount)
            .sum();
        assert_eq!(sent, recorded);

        let consumed: i64 = payouts.iter().filter(|p| p.is_closed()).map(|p| p.penalties_applied).sum();
        let pending = h.store.partner(partner.id).unwrap().pending_penalties;
        assert_eq!(penalties_before - pending, consumed);
    }

    #[tokio::test]
    async fn test_penalties_larger_than_a_month_carry_into_the_next() {
        let h = harness();
        let fx = testing::seed_booking_at(&h.store, 500, BookingStatus::Paid, Some("pi_1"), at(9, 14));
        connect(&h, &fx.partner);
        h.store.set_pending_penalties(fx.partner.id, 820);

        generator(&h).generate(on(10, 5)).await.unwrap();
        let september = h.executor.execute().await.unwrap();
        assert_eq!(september.settled, 1);
        assert!(h.processor.transfers().is_empty());
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 420);

        testing::add_booking_at(&h.store, &fx, 10_000, BookingStatus::Paid, at(10, 14));
        generator(&h).generate(on(11, 5)).await.unwrap();
        let october = h.executor.execute().await.unwrap();

        assert_eq!(october.paid, 1);
        let transfers = h.processor.transfers();
        assert_eq!(transfers.len(), 1);
        // 400 + 8_000 earned, 820 owed.
        assert_eq!(transfers[0].amount, 7_580);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 0);
        assert_ledger_balanced(&h, &fx.partner, 820);
    }

    #[tokio::test]
    async fn test_two_unpaid_months_share_penalties_once() {
        let h = harness();
        let fx = testing::seed_booking_at(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"), at(9, 14));
        testing::add_booking_at(&h.store, &fx, 10_000, BookingStatus::Paid, at(10, 14));
        let mut not_onboarded = fx.partner.clone();
        not_onboarded.connected_account_id = None;
        h.store.seed_partner(not_onboarded);
        h.store.set_pending_penalties(fx.partner.id, 820);

        generator(&h).generate(on(10, 5)).await.unwrap();
        generator(&h).generate(on(11, 5)).await.unwrap();
        let waiting = h.executor.execute().await.unwrap();
        assert_eq!(waiting.skipped, 2);

        h.store.seed_partner(fx.partner.clone());
        h.store.set_pending_penalties(fx.partner.id, 820);
        connect(&h, &fx.partner);
        let report = h.executor.execute().await.unwrap();

        assert_eq!(report.paid, 2);
        let sent: i64 = h.processor.transfers().iter().map(|t| t.amount).sum();
        assert_eq!(sent, 16_000 - 820);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 0);
        assert_ledger_balanced(&h, &fx.partner, 820);
    }

    #[tokio::test]
    async fn test_regeneration_after_unconfirmed_transfer_keeps_sent_amount() {
        let h = harness();
        let fx = testing::seed_booking_at(&h.store, 10_000, BookingStatus::Paid, Some("pi_1"), at(9, 14));
        connect(&h, &fx.partner);
        h.store.set_pending_penalties(fx.partner.id, 820);
        generator(&h).generate(on(10, 5)).await.unwrap();
        h.processor
            .fail_after_apply(MockPaymentProcessor::CREATE_TRANSFER, ProcessorError::Timeout);
        let first = h.executor.execute().await.unwrap();
        assert_eq!(first.pending_retry, 1);

        // A new cancellation penalty and a late booking arrive before the retry.
        h.store.set_pending_penalties(fx.partner.id, 1_320);
        testing::add_booking_at(&h.store, &fx, 5_000, BookingStatus::Paid, at(9, 20));
        let regenerated = generator(&h).generate(on(10, 5)).await.unwrap();
        assert_eq!(regenerated.in_flight, 1);

        let retry = h.executor.execute().await.unwrap();

        assert_eq!(retry.paid, 1);
        let transfers = h.processor.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 7_180);
        let payout = h.store.payouts().remove(0);
        assert_eq!(payout.net_amount, 7_180);
        assert_eq!(payout.penalties_applied, 820);
        assert_eq!(h.store.partner(fx.partner.id).unwrap().pending_penalties, 500);
        assert_ledger_balanced(&h, &fx.partner, 1_320);
    }
}
