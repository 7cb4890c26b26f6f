use clubhouse_core::models::{
    BookingContext, CancellationRecord, EmailMessage, InstallmentDue, Partner, Payout, Subscription,
};
use clubhouse_core::repository::NotificationQueue;
use clubhouse_core::Money;
use clubhouse_shared::mask_email;
use std::sync::Arc;
use tracing::{debug, warn};

/// `1234` in EUR renders as `12.34 EUR`.
pub fn format_amount(amount: Money, currency: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency.to_uppercase())
}

fn greeting(name: Option<&str>) -> String {
    match name {
        Some(name) if !name.trim().is_empty() => format!("Hi {},", name.trim()),
        _ => "Hi,".to_string(),
    }
}

/// Builds transactional emails and drops them on the notification queue.
/// Queueing is best effort: a failed insert is logged and reported as `false`,
/// never propagated into the money flow that triggered it.
#[derive(Clone)]
pub struct Notifier {
    queue: Arc<dyn NotificationQueue>,
    currency: String,
}

impl Notifier {
    pub fn new(queue: Arc<dyn NotificationQueue>, currency: impl Into<String>) -> Self {
        Self {
            queue,
            currency: currency.into(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn deliver(&self, message: EmailMessage, kind: &'static str) -> bool {
        let recipient = mask_email(message.to_address.expose());
        match self.queue.enqueue(&message).await {
            Ok(id) => {
                debug!(email_id = %id, kind, to = %recipient, "Email queued");
                true
            }
            Err(e) => {
                warn!(kind, to = %recipient, error = %e, "Failed to queue email");
                false
            }
        }
    }

    fn amount(&self, amount: Money) -> String {
        format_amount(amount, &self.currency)
    }

    pub fn refund_confirmation(&self, ctx: &BookingContext, record: &CancellationRecord) -> EmailMessage {
        let content = format!(
            "{}\n\n\
             Your booking for \"{}\" has been cancelled by {}.\n\
             Reason given: {}\n\n\
             A full refund of {} has been issued to your original payment method. \
             Depending on your bank it can take 5-10 business days to appear.\n",
            greeting(ctx.subscriber_name.as_deref()),
            ctx.offer_title,
            ctx.partner.name,
            record.reason,
            self.amount(ctx.booking.amount),
        );
        EmailMessage {
            to_address: ctx.subscriber_email.clone(),
            subject: format!("Your booking for {} was cancelled", ctx.offer_title),
            content,
        }
    }

    pub fn cancellation_fee_recap(&self, ctx: &BookingContext, record: &CancellationRecord) -> EmailMessage {
        let content = format!(
            "{}\n\n\
             You cancelled booking {} for \"{}\".\n\
             Reason: {}\n\n\
             The subscriber received a full refund of {}.\n\
             Payment processing fee: {}\n\
             Management fee: {}\n\
             Total penalty: {}\n\n\
             The penalty will be deducted from your next payout.\n",
            greeting(Some(&ctx.partner.name)),
            ctx.booking.id,
            ctx.offer_title,
            record.reason,
            self.amount(ctx.booking.amount),
            self.amount(record.processor_fee),
            self.amount(record.management_fee),
            self.amount(record.penalty),
        );
        EmailMessage {
            to_address: ctx.partner.email.clone(),
            subject: "Cancellation fees for your booking".to_string(),
            content,
        }
    }

    pub fn payout_sent(&self, partner: &Partner, payout: &Payout, statement_url: Option<&str>) -> EmailMessage {
        let mut content = format!(
            "{}\n\n\
             Your payout for {} is on its way.\n\
             Gross earnings: {} across {} booking(s)\n\
             Penalties deducted: {}\n\
             Net transferred: {}\n",
            greeting(Some(&partner.name)),
            payout.period.label(),
            self.amount(payout.gross_earnings),
            payout.booking_count,
            self.amount(payout.penalties_applied),
            self.amount(payout.net_amount),
        );
        if let Some(url) = statement_url {
            content.push_str(&format!("\nYour statement: {}\n", url));
        }
        EmailMessage {
            to_address: partner.email.clone(),
            subject: format!("Payout for {} sent", payout.period.label()),
            content,
        }
    }

    pub fn welcome(&self, subscription: &Subscription) -> EmailMessage {
        let content = format!(
            "{}\n\n\
             Welcome to the club! Your membership is now active and you can start \
             booking experiences right away.\n",
            greeting(subscription.subscriber_name.as_deref()),
        );
        EmailMessage {
            to_address: subscription.subscriber_email.clone(),
            subject: "Welcome to the club".to_string(),
            content,
        }
    }

    pub fn installment_reminder(&self, due: &InstallmentDue) -> EmailMessage {
        let installment = &due.installment;
        let content = format!(
            "{}\n\n\
             Installment {} of {} for {} ({}) is due on {}.\n\
             Please make sure your payment method has sufficient funds.\n",
            greeting(due.subscriber_name.as_deref()),
            installment.sequence,
            due.installment_count,
            due.plan_description,
            self.amount(installment.amount),
            installment.due_date.format("%d %B %Y"),
        );
        EmailMessage {
            to_address: due.subscriber_email.clone(),
            subject: format!("Upcoming payment on {}", installment.due_date.format("%Y-%m-%d")),
            content,
        }
    }
}
