pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod memory_repo;
pub mod notification_repo;
pub mod partner_repo;
pub mod payout_repo;
pub mod reconciliation_repo;
pub mod redis_repo;
pub mod stripe;
pub mod subscription_repo;
pub mod wallet_repo;

pub use booking_repo::StoreBookingRepository;
pub use database::DbClient;
pub use memory_repo::InMemoryStore;
pub use notification_repo::StoreNotificationQueue;
pub use partner_repo::StorePartnerRepository;
pub use payout_repo::StorePayoutRepository;
pub use reconciliation_repo::StoreReconciliationRepository;
pub use redis_repo::RedisClient;
pub use stripe::StripeProcessor;
pub use subscription_repo::StoreSubscriptionRepository;
pub use wallet_repo::StoreWalletRepository;
