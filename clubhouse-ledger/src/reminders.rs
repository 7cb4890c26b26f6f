use chrono::{Days, NaiveDate};
use clubhouse_core::models::InstallmentStatus;
use clubhouse_core::repository::InstallmentRepository;
use clubhouse_core::{LedgerError, LedgerResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::notifications::Notifier;

#[derive(Debug, Clone, Serialize)]
pub struct ReminderReport {
    pub target_date: NaiveDate,
    pub reminded: usize,
    pub failed: usize,
}

pub struct InstallmentReminderScheduler {
    installments: Arc<dyn InstallmentRepository>,
    notifier: Notifier,
    days_ahead: u32,
}

impl InstallmentReminderScheduler {
    pub fn new(installments: Arc<dyn InstallmentRepository>, notifier: Notifier, days_ahead: u32) -> Self {
        Self {
            installments,
            notifier,
            days_ahead,
        }
    }

    /// Queues one reminder per pending installment due exactly `days_ahead` after `today`.
    pub async fn run(&self, today: NaiveDate) -> LedgerResult<ReminderReport> {
        let target_date = today
            .checked_add_days(Days::new(u64::from(self.days_ahead)))
            .ok_or_else(|| LedgerError::Validation(format!("Date out of range: {}", today)))?;

        let due = self.installments.pending_due_on(target_date).await?;
        let mut report = ReminderReport {
            target_date,
            reminded: 0,
            failed: 0,
        };

        for item in due
            .iter()
            .filter(|d| d.installment.status == InstallmentStatus::Pending)
        {
            if self
                .notifier
                .deliver(self.notifier.installment_reminder(item), "installment_reminder")
                .await
            {
                report.reminded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            target_date = %target_date,
            reminded = report.reminded,
            failed = report.failed,
            "Installment reminders queued"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use clubhouse_store::InMemoryStore;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[tokio::test]
    async fn test_reminds_only_target_day() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_installment(testing::installment(day(19), InstallmentStatus::Pending));
        store.seed_installment(testing::installment(day(19), InstallmentStatus::Paid));
        store.seed_installment(testing::installment(day(20), InstallmentStatus::Pending));
        let scheduler = InstallmentReminderScheduler::new(store.clone(), Notifier::new(store.clone(), "eur"), 3);

        let report = scheduler.run(day(16)).await.unwrap();

        assert_eq!(report.target_date, day(19));
        assert_eq!(report.reminded, 1);
        assert_eq!(report.failed, 0);
        let emails = store.emails();
        assert_eq!(emails.len(), 1);
        assert!(emails[0].subject.contains("2026-10-19"));
    }

    #[tokio::test]
    async fn test_queue_failures_are_counted() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_installment(testing::installment(day(19), InstallmentStatus::Pending));
        store.seed_installment(testing::installment(day(19), InstallmentStatus::Pending));
        store.fail_on("enqueue");
        let scheduler = InstallmentReminderScheduler::new(store.clone(), Notifier::new(store.clone(), "eur"), 3);

        let report = scheduler.run(day(16)).await.unwrap();

        assert_eq!(report.reminded, 0);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_nothing_due() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = InstallmentReminderScheduler::new(store.clone(), Notifier::new(store.clone(), "eur"), 3);
        let report = scheduler.run(day(1)).await.unwrap();
        assert_eq!(report.reminded, 0);
        assert_eq!(report.target_date, day(4));
    }
}
