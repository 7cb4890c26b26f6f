use clubhouse_core::models::{Partner, Payout, PayoutStatement};
use clubhouse_core::repository::{PartnerRepository, PayoutRepository};
use clubhouse_core::{AuthenticatedUser, LedgerError, LedgerResult};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::notifications::format_amount;

/// Turns a payout into the document partners download from their statement link.
pub trait StatementRenderer: Send + Sync {
    fn render(&self, payout: &Payout, partner: &Partner) -> String;

    fn content_type(&self) -> &'static str;
}

pub struct PlainTextStatement {
    currency: String,
}

impl PlainTextStatement {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
        }
    }
}

impl StatementRenderer for PlainTextStatement {
    fn render(&self, payout: &Payout, partner: &Partner) -> String {
        let amount = |value| format_amount(value, &self.currency);
        let rows = [
            ("Partner", partner.name.clone()),
            ("Payout", payout.id.to_string()),
            (
                "Period",
                format!("{} ({} to {})", payout.period.label(), payout.period.start, payout.period.end),
            ),
            ("Bookings", payout.booking_count.to_string()),
            ("Gross earnings", amount(payout.gross_earnings)),
            ("Penalties", amount(-payout.penalties_applied)),
            ("Net payout", amount(payout.net_amount)),
        ];

        let mut out = String::from("PAYOUT STATEMENT\n================\n\n");
        for (label, value) in rows {
            out.push_str(&format!("{:<16}{}\n", format!("{}:", label), value));
        }
        out.push_str(&format!("\nIssued {}\n", payout.updated_at.format("%Y-%m-%d")));
        out
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }
}

/// Serves stored statements to the owning partner and to operators.
pub struct StatementReader {
    payouts: Arc<dyn PayoutRepository>,
    partners: Arc<dyn PartnerRepository>,
    content_type: &'static str,
}

impl StatementReader {
    pub fn new(
        payouts: Arc<dyn PayoutRepository>,
        partners: Arc<dyn PartnerRepository>,
        renderer: &dyn StatementRenderer,
    ) -> Self {
        Self {
            payouts,
            partners,
            content_type: renderer.content_type(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub async fn read(&self, caller: &AuthenticatedUser, payout_id: Uuid) -> LedgerResult<PayoutStatement> {
        let statement = self
            .payouts
            .get_statement(payout_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("statement", payout_id))?;

        if caller.is_operator() {
            return Ok(statement);
        }

        let owner = self
            .partners
            .get_partner(statement.partner_id)
            .await?
            .map(|p| p.owner_user_id);
        if owner != Some(caller.user_id) {
            warn!(%payout_id, user_id = %caller.user_id, "Statement requested by non-owner");
            return Err(LedgerError::Unauthorized(
                "Only the partner owner can read this statement".to_string(),
            ));
        }
        Ok(statement)
    }
}
