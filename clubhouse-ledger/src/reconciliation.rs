use clubhouse_core::models::{
    BookingStatus, LocalEffect, NewReconciliationEntry, PayoutStatus, ReconciliationEntry,
};
use clubhouse_core::repository::{BookingRepository, PayoutRepository, ReconciliationRepository};
use clubhouse_core::{LedgerResult, StoreResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Records a confirmed external action whose local write failed. If even
/// this insert fails the effect is logged in full so it can be replayed by hand.
pub(crate) async fn flag(
    repo: &dyn ReconciliationRepository,
    entry: NewReconciliationEntry,
) -> Option<Uuid> {
    match repo.record_entry(&entry).await {
        Ok(recorded) => {
            warn!(
                entry_id = %recorded.id,
                kind = %recorded.kind,
                external_reference = %recorded.external_reference,
                "Reconciliation entry opened"
            );
            Some(recorded.id)
        }
        Err(e) => {
            let effect = serde_json::to_string(&entry.effect).unwrap_or_default();
            error!(
                kind = %entry.kind,
                external_reference = %entry.external_reference,
                effect = %effect,
                error = %e,
                "Could not record reconciliation entry; manual repair required"
            );
            None
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub still_open: usize,
}

enum Applied {
    Resolved,
    Open(String),
}

/// Re-applies the pending local effect of open reconciliation entries. Every
/// effect goes through the same guarded store operation as the original
/// flow, so replaying one that already landed is harmless.
pub struct ReconciliationSweeper {
    bookings: Arc<dyn BookingRepository>,
    payouts: Arc<dyn PayoutRepository>,
    reconciliation: Arc<dyn ReconciliationRepository>,
    batch_size: i64,
}

impl ReconciliationSweeper {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        payouts: Arc<dyn PayoutRepository>,
        reconciliation: Arc<dyn ReconciliationRepository>,
        batch_size: i64,
    ) -> Self {
        Self {
            bookings,
            payouts,
            reconciliation,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep(&self) -> LedgerResult<SweepReport> {
        let entries = self.reconciliation.open_entries(self.batch_size).await?;
        let mut report = SweepReport {
            examined: entries.len(),
            ..SweepReport::default()
        };

        for entry in entries {
            let outcome = match self.apply(&entry).await {
                Ok(outcome) => outcome,
                Err(e) => Applied::Open(e.to_string()),
            };
            match outcome {
                Applied::Resolved => match self.reconciliation.mark_resolved(entry.id).await {
                    Ok(()) => {
                        info!(entry_id = %entry.id, kind = %entry.kind, "Reconciliation entry resolved");
                        report.resolved += 1;
                    }
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "Effect applied but entry not closed");
                        report.still_open += 1;
                    }
                },
                Applied::Open(reason) => {
                    warn!(entry_id = %entry.id, attempts = entry.attempts + 1, reason = %reason, "Reconciliation entry still open");
                    if let Err(e) = self.reconciliation.record_attempt(entry.id, &reason).await {
                        warn!(entry_id = %entry.id, error = %e, "Could not record reconciliation attempt");
                    }
                    report.still_open += 1;
                }
            }
        }

        Ok(report)
    }

    async fn apply(&self, entry: &ReconciliationEntry) -> StoreResult<Applied> {
        match &entry.effect {
            LocalEffect::CancelBooking {
                booking_id,
                partner_id,
                expected_status,
                record,
            } => {
                if self
                    .bookings
                    .record_cancellation(*booking_id, *expected_status, *partner_id, record)
                    .await?
                {
                    return Ok(Applied::Resolved);
                }
                let Some(ctx) = self.bookings.get_booking_context(*booking_id).await? else {
                    return Ok(Applied::Open("booking no longer exists".to_string()));
                };
                match ctx.booking.status {
                    BookingStatus::Cancelled => Ok(Applied::Resolved),
                    current => {
                        // The booking moved on after the refund; cancel from where it is now.
                        let applied = self
                            .bookings
                            .record_cancellation(*booking_id, current, *partner_id, record)
                            .await?;
                        Ok(if applied {
                            Applied::Resolved
                        } else {
                            Applied::Open(format!("booking status changed from {}", current))
                        })
                    }
                }
            }
            LocalEffect::MarkPayoutPaid {
                payout_id,
                partner_id,
                transfer_id,
                penalties_settled,
            } => {
                if self
                    .payouts
                    .mark_payout_paid(*payout_id, *partner_id, transfer_id, *penalties_settled)
                    .await?
                {
                    return Ok(Applied::Resolved);
                }
                match self.payouts.get_payout(*payout_id).await? {
                    Some(payout) if payout.status == PayoutStatus::Paid => Ok(Applied::Resolved),
                    Some(payout) => Ok(Applied::Open(format!(
                        "payout is {} but transfer {} succeeded",
                        payout.status, transfer_id
                    ))),
                    None => Ok(Applied::Open("payout no longer exists".to_string())),
                }
            }
        }
    }
}
