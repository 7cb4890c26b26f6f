use chrono::NaiveDate;
use clubhouse_core::models::{BillingPeriod, PayoutDraft, PayoutStatus, PayoutUpsert};
use clubhouse_core::repository::{BookingRepository, PartnerRepository, PayoutRepository};
use clubhouse_core::{LedgerError, LedgerResult, Money};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PayoutLine {
    pub partner_id: Uuid,
    pub payout_id: Uuid,
    pub net_amount: Money,
    pub status: PayoutStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub period: BillingPeriod,
    pub created: usize,
    pub updated: usize,
    /// Paid or settled rows left as they were.
    pub closed: usize,
    /// Rows with a transfer attempt on record, left as they were.
    pub in_flight: usize,
    pub failed: usize,
    /// Sum of positive net amounts left pending for transfer.
    pub total_transferable: Money,
    pub payouts: Vec<PayoutLine>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accrual {
    gross_earnings: Money,
    booking_count: i64,
    pending_penalties: Money,
}

/// Net payable is gross earnings minus the penalties available at generation
/// time. Penalties beyond the gross are not applied here; they stay pending and
/// carry into the next period, so a net of zero settles without a transfer.
pub fn draft_for(
    partner_id: Uuid,
    period: BillingPeriod,
    gross: Money,
    bookings: i64,
    available_penalties: Money,
) -> PayoutDraft {
    let applied = available_penalties.clamp(0, gross.max(0));
    PayoutDraft {
        partner_id,
        period,
        gross_earnings: gross,
        penalties_applied: applied,
        booking_count: bookings,
        net_amount: gross - applied,
    }
}

/// Monthly payout computation, keyed on (partner, period) so re-runs
/// converge on one row per partner.
pub struct PayoutGenerator {
    bookings: Arc<dyn BookingRepository>,
    partners: Arc<dyn PartnerRepository>,
    payouts: Arc<dyn PayoutRepository>,
}

impl PayoutGenerator {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        partners: Arc<dyn PartnerRepository>,
        payouts: Arc<dyn PayoutRepository>,
    ) -> Self {
        Self {
            bookings,
            partners,
            payouts,
        }
    }

    /// Generates payouts for the calendar month before `reference`.
    pub async fn generate(&self, reference: NaiveDate) -> LedgerResult<GenerationReport> {
        let period = BillingPeriod::prior_month(reference).ok_or_else(|| {
            LedgerError::Validation(format!("No billing period before {}", reference))
        })?;

        let mut accruals: BTreeMap<Uuid, Accrual> = BTreeMap::new();
        for earnings in self.bookings.settled_earnings(&period).await? {
            let accrual = accruals.entry(earnings.partner_id).or_default();
            accrual.gross_earnings += earnings.gross_earnings;
            accrual.booking_count += earnings.booking_count;
        }
        for partner in self.partners.partners_with_pending_penalties().await? {
            accruals.entry(partner.id).or_default().pending_penalties = partner.pending_penalties;
        }

        info!(period = %period.label(), partners = accruals.len(), "Generating payouts");

        let mut report = GenerationReport {
            period,
            created: 0,
            updated: 0,
            closed: 0,
            in_flight: 0,
            failed: 0,
            total_transferable: 0,
            payouts: Vec::with_capacity(accruals.len()),
        };

        for (partner_id, accrual) in accruals {
            let available = match self.available_penalties(partner_id, &period, accrual.pending_penalties).await {
                Ok(available) => available,
                Err(e) => {
                    error!(%partner_id, period = %period.label(), error = %e, "Failed to read committed penalties");
                    report.failed += 1;
                    continue;
                }
            };
            let draft = draft_for(
                partner_id,
                period,
                accrual.gross_earnings,
                accrual.booking_count,
                available,
            );
            let upsert = match self.payouts.upsert_payout(&draft).await {
                Ok(upsert) => upsert,
                Err(e) => {
                    error!(%partner_id, period = %period.label(), error = %e, "Failed to write payout");
                    report.failed += 1;
                    continue;
                }
            };

            match &upsert {
                PayoutUpsert::Created(_) => report.created += 1,
                PayoutUpsert::Updated(_) => report.updated += 1,
                PayoutUpsert::Closed(_) => report.closed += 1,
                PayoutUpsert::InFlight(_) => report.in_flight += 1,
            }
            let payout = upsert.payout();
            if payout.is_transferable() {
                report.total_transferable += payout.net_amount;
            }
            report.payouts.push(PayoutLine {
                partner_id,
                payout_id: payout.id,
                net_amount: payout.net_amount,
                status: payout.status,
            });
        }

        info!(
            period = %period.label(),
            created = report.created,
            updated = report.updated,
            closed = report.closed,
            in_flight = report.in_flight,
            failed = report.failed,
            total_transferable = report.total_transferable,
            "Payout generation finished"
        );
        Ok(report)
    }

    /// Pending penalties not yet reserved by another unsettled payout of the partner.
    async fn available_penalties(&self, partner_id: Uuid, period: &BillingPeriod, pending: Money) -> LedgerResult<Money> {
        if pending <= 0 {
            return Ok(0);
        }
        let committed = self.payouts.committed_penalties(partner_id, period).await?;
        Ok((pending - committed).max(0))
    }
}
