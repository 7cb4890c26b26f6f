use clubhouse_core::payment::PaymentProcessor;
use clubhouse_core::repository::{
    BookingRepository, InstallmentRepository, NotificationQueue, PartnerRepository,
    PayoutRepository, ReconciliationRepository, SubscriptionRepository, WalletRepository,
};
use clubhouse_core::LedgerResult;
use clubhouse_ledger::{
    BookingRecorder, CancellationProcessor, CancellationSettings, CommissionCalculator,
    CommissionRate, InstallmentReminderScheduler, Notifier, PayoutGenerator, PlainTextStatement,
    ReconciliationSweeper, RetryPolicy, StatementReader, StatementRenderer, SubscriptionSynchronizer,
    TransferExecutor, TransferSettings, WalletDebitProcessor,
};
use clubhouse_store::app_config::Config;
use clubhouse_store::{
    RedisClient, StoreBookingRepository, StoreNotificationQueue, StorePartnerRepository,
    StorePayoutRepository, StoreReconciliationRepository, StoreSubscriptionRepository,
    StoreWalletRepository,
};
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct RateLimit {
    pub redis: Arc<RedisClient>,
    pub requests_per_minute: i64,
}

/// Every storage seam the services need, as trait objects.
#[derive(Clone)]
pub struct Repositories {
    pub bookings: Arc<dyn BookingRepository>,
    pub partners: Arc<dyn PartnerRepository>,
    pub payouts: Arc<dyn PayoutRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub installments: Arc<dyn InstallmentRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub notifications: Arc<dyn NotificationQueue>,
    pub reconciliation: Arc<dyn ReconciliationRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        let subscriptions = Arc::new(StoreSubscriptionRepository::new(pool.clone()));
        Self {
            bookings: Arc::new(StoreBookingRepository::new(pool.clone())),
            partners: Arc::new(StorePartnerRepository::new(pool.clone())),
            payouts: Arc::new(StorePayoutRepository::new(pool.clone())),
            subscriptions: subscriptions.clone(),
            installments: subscriptions,
            wallets: Arc::new(StoreWalletRepository::new(pool.clone())),
            notifications: Arc::new(StoreNotificationQueue::new(pool.clone())),
            reconciliation: Arc::new(StoreReconciliationRepository::new(pool)),
        }
    }

    /// One store serving every seam, e.g. the in-memory store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: BookingRepository
            + PartnerRepository
            + PayoutRepository
            + SubscriptionRepository
            + InstallmentRepository
            + WalletRepository
            + NotificationQueue
            + ReconciliationRepository
            + 'static,
    {
        Self {
            bookings: store.clone(),
            partners: store.clone(),
            payouts: store.clone(),
            subscriptions: store.clone(),
            installments: store.clone(),
            wallets: store.clone(),
            notifications: store.clone(),
            reconciliation: store,
        }
    }
}

/// Tunables for the ledger services, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub currency: String,
    pub default_commission_bps: u32,
    pub cancellation: CancellationSettings,
    pub reminder_days_ahead: u32,
    pub retry: RetryPolicy,
    pub transfer_concurrency: usize,
    pub reconciliation_batch_size: i64,
    pub statement_base_url: String,
}

impl LedgerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            currency: config.processor.currency.clone(),
            default_commission_bps: config.business_rules.default_commission_bps,
            cancellation: CancellationSettings {
                management_fee: config.business_rules.management_fee,
                min_reason_len: config.business_rules.cancellation_reason_min_len,
            },
            reminder_days_ahead: config.business_rules.reminder_days_ahead,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                initial_backoff_ms: config.retry.initial_backoff_ms,
                max_backoff_ms: config.retry.max_backoff_ms,
                multiplier: config.retry.multiplier,
            },
            transfer_concurrency: config.payouts.transfer_concurrency,
            reconciliation_batch_size: config.payouts.reconciliation_batch_size,
            statement_base_url: config.statements.public_base_url.clone(),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            default_commission_bps: 2000,
            cancellation: CancellationSettings::default(),
            reminder_days_ahead: 3,
            retry: RetryPolicy::default(),
            transfer_concurrency: 4,
            reconciliation_batch_size: 50,
            statement_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthConfig,
    pub rate_limit: Option<RateLimit>,
    pub bookings: Arc<BookingRecorder>,
    pub cancellations: Arc<CancellationProcessor>,
    pub subscriptions: Arc<SubscriptionSynchronizer>,
    pub wallet: Arc<WalletDebitProcessor>,
    pub payouts: Arc<PayoutGenerator>,
    pub transfers: Arc<TransferExecutor>,
    pub reminders: Arc<InstallmentReminderScheduler>,
    pub reconciliation: Arc<ReconciliationSweeper>,
    pub statements: Arc<StatementReader>,
}

impl AppState {
    /// Wires every service from its repositories. Fails only on an invalid
    /// default commission rate.
    pub fn new(
        repos: Repositories,
        processor: Arc<dyn PaymentProcessor>,
        settings: &LedgerSettings,
        auth: AuthConfig,
    ) -> LedgerResult<Self> {
        let calculator = CommissionCalculator::new(CommissionRate::from_bps(settings.default_commission_bps)?);
        let notifier = Notifier::new(repos.notifications.clone(), settings.currency.clone());
        let renderer: Arc<dyn StatementRenderer> = Arc::new(PlainTextStatement::new(settings.currency.clone()));

        Ok(Self {
            auth,
            rate_limit: None,
            bookings: Arc::new(BookingRecorder::new(repos.bookings.clone(), calculator)),
            cancellations: Arc::new(CancellationProcessor::new(
                repos.bookings.clone(),
                repos.reconciliation.clone(),
                processor.clone(),
                notifier.clone(),
                settings.retry,
                settings.cancellation,
            )),
            subscriptions: Arc::new(SubscriptionSynchronizer::new(
                repos.subscriptions.clone(),
                processor.clone(),
                notifier.clone(),
                settings.retry,
            )),
            wallet: Arc::new(WalletDebitProcessor::new(repos.wallets.clone())),
            payouts: Arc::new(PayoutGenerator::new(
                repos.bookings.clone(),
                repos.partners.clone(),
                repos.payouts.clone(),
            )),
            transfers: Arc::new(TransferExecutor::new(
                repos.partners.clone(),
                repos.payouts.clone(),
                repos.reconciliation.clone(),
                processor,
                renderer.clone(),
                notifier.clone(),
                settings.retry,
                TransferSettings {
                    currency: settings.currency.clone(),
                    concurrency: settings.transfer_concurrency,
                    statement_base_url: settings.statement_base_url.clone(),
                },
            )),
            reminders: Arc::new(InstallmentReminderScheduler::new(
                repos.installments.clone(),
                notifier,
                settings.reminder_days_ahead,
            )),
            reconciliation: Arc::new(ReconciliationSweeper::new(
                repos.bookings.clone(),
                repos.payouts.clone(),
                repos.reconciliation.clone(),
                settings.reconciliation_batch_size,
            )),
            statements: Arc::new(StatementReader::new(repos.payouts, repos.partners, renderer.as_ref())),
        })
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}
