pub mod identity;
pub mod models;
pub mod payment;
pub mod repository;

pub use identity::{AuthenticatedUser, Role};
pub use payment::{MockPaymentProcessor, PaymentProcessor, ProcessorError};
pub use repository::{StoreError, StoreResult};

/// Amounts are always integer minor currency units (cents).
pub type Money = i64;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: String,
        needs_sync: bool,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Payment processor error: {0}")]
    External(#[from] ProcessorError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
            needs_sync: false,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
