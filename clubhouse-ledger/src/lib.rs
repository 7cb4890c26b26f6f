pub mod booking;
pub mod cancellation;
pub mod commission;
pub mod notifications;
pub mod payout;
pub mod reconciliation;
pub mod reminders;
pub mod retry;
pub mod statement;
pub mod subscription;
#[cfg(test)]
mod testing;
pub mod transfer;
pub mod wallet;

pub use booking::{BookingRecorder, RecordBooking};
pub use cancellation::{CancellationOutcome, CancellationProcessor, CancellationReceipt, CancellationSettings};
pub use commission::{CommissionCalculator, CommissionRate, PricingInput};
pub use notifications::Notifier;
pub use payout::{GenerationReport, PayoutGenerator};
pub use reconciliation::{ReconciliationSweeper, SweepReport};
pub use reminders::{InstallmentReminderScheduler, ReminderReport};
pub use retry::RetryPolicy;
pub use statement::{PlainTextStatement, StatementReader, StatementRenderer};
pub use subscription::{SubscriptionSynchronizer, SyncOutcome};
pub use transfer::{ExecutionReport, TransferExecutor, TransferSettings};
pub use wallet::WalletDebitProcessor;
