use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::SubscriptionStatus;
use crate::Money;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("Request to payment processor timed out")]
    Timeout,
    #[error("Payment processor unreachable: {0}")]
    Network(String),
    #[error("Payment processor rejected request ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("Unexpected payment processor response: {0}")]
    InvalidResponse(String),
}

impl ProcessorError {
    /// Transient failures where the request demonstrably did not take effect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout | Self::InvalidResponse(_) => false,
        }
    }

    /// The request may or may not have been applied by the processor.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such {}: '{}'", what, id),
        }
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_intent_id: String,
    pub amount: Money,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Refund {
    pub id: String,
    pub payment_intent_id: String,
    pub amount: Money,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl CheckoutPaymentStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Paid | Self::NoPaymentRequired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_status: CheckoutPaymentStatus,
    pub subscription: Option<ProcessorSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedAccount {
    pub id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount: Money,
    pub currency: String,
    pub destination: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transfer {
    pub id: String,
    pub amount: Money,
    pub destination: String,
}

/// The charge/refund/transfer/subscription surface the ledger consumes.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Fee the processor actually charged on the payment's balance transaction
    async fn charge_fee(&self, payment_intent_id: &str) -> ProcessorResult<Money>;

    /// Refund a payment; repeated calls with the same idempotency key return the same refund
    async fn create_refund(&self, request: &RefundRequest) -> ProcessorResult<Refund>;

    /// Look up an existing refund for a payment, used to resolve unknown outcomes
    async fn find_refund(&self, payment_intent_id: &str) -> ProcessorResult<Option<Refund>>;

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProcessorResult<CheckoutSession>;

    async fn retrieve_account(&self, account_id: &str) -> ProcessorResult<ConnectedAccount>;

    /// Move funds to a connected account
    async fn create_transfer(&self, request: &TransferRequest) -> ProcessorResult<Transfer>;
}

enum MockFailure {
    Before(ProcessorError),
    AfterApply(ProcessorError),
}

#[derive(Default)]
struct MockState {
    fees: HashMap<String, Money>,
    sessions: HashMap<String, CheckoutSession>,
    accounts: HashMap<String, ConnectedAccount>,
    refunds: Vec<(String, Refund)>,
    transfers: Vec<(TransferRequest, Transfer)>,
    failures: HashMap<&'static str, VecDeque<MockFailure>>,
    calls: HashMap<&'static str, usize>,
}

/// In-process processor used for local runs and tests.
///
/// Honours idempotency keys the way the real processor does, and can be
/// scripted to fail before or after applying a call.
pub struct MockPaymentProcessor {
    default_fee: Money,
    state: Mutex<MockState>,
}

impl MockPaymentProcessor {
    pub const CHARGE_FEE: &'static str = "charge_fee";
    pub const CREATE_REFUND: &'static str = "create_refund";
    pub const FIND_REFUND: &'static str = "find_refund";
    pub const RETRIEVE_SESSION: &'static str = "retrieve_checkout_session";
    pub const RETRIEVE_ACCOUNT: &'static str = "retrieve_account";
    pub const CREATE_TRANSFER: &'static str = "create_transfer";

    pub fn new() -> Self {
        Self::with_default_fee(0)
    }

    pub fn with_default_fee(default_fee: Money) -> Self {
        Self {
            default_fee,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fee(&self, payment_intent_id: &str, fee: Money) {
        self.state().fees.insert(payment_intent_id.to_string(), fee);
    }

    pub fn add_session(&self, session: CheckoutSession) {
        self.state().sessions.insert(session.id.clone(), session);
    }

    pub fn add_account(&self, account: ConnectedAccount) {
        self.state().accounts.insert(account.id.clone(), account);
    }

    /// The next call to `operation` fails without side effects.
    pub fn fail_next(&self, operation: &'static str, error: ProcessorError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(MockFailure::Before(error));
    }

    /// The next call to `operation` takes effect but reports `error`.
    pub fn fail_after_apply(&self, operation: &'static str, error: ProcessorError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(MockFailure::AfterApply(error));
    }

    pub fn refunds(&self) -> Vec<Refund> {
        self.state().refunds.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.state().transfers.iter().map(|(req, _)| req.clone()).collect()
    }

    pub fn calls(&self, operation: &'static str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    /// Records the call and pops any scripted failure for it.
    fn enter(&self, operation: &'static str) -> Result<Option<ProcessorError>, ProcessorError> {
        let mut state = self.state();
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(MockFailure::Before(err)) => Err(err),
            Some(MockFailure::AfterApply(err)) => Ok(Some(err)),
            None => Ok(None),
        }
    }
}

impl Default for MockPaymentProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProcessor for MockPaymentProcessor {
    async fn charge_fee(&self, payment_intent_id: &str) -> ProcessorResult<Money> {
        if let Some(err) = self.enter(Self::CHARGE_FEE)? {
            return Err(err);
        }
        let state = self.state();
        Ok(state.fees.get(payment_intent_id).copied().unwrap_or(self.default_fee))
    }

    async fn create_refund(&self, request: &RefundRequest) -> ProcessorResult<Refund> {
        let late_failure = self.enter(Self::CREATE_REFUND)?;
        let mut state = self.state();

        let refund = match state.refunds.iter().find(|(key, _)| key == &request.idempotency_key) {
            Some((_, existing)) => existing.clone(),
            None => {
                let refund = Refund {
                    id: format!("re_mock_{}", Uuid::new_v4().simple()),
                    payment_intent_id: request.payment_intent_id.clone(),
                    amount: request.amount,
                    status: "succeeded".to_string(),
                };
                state.refunds.push((request.idempotency_key.clone(), refund.clone()));
                refund
            }
        };

        match late_failure {
            Some(err) => Err(err),
            None => Ok(refund),
        }
    }

    async fn find_refund(&self, payment_intent_id: &str) -> ProcessorResult<Option<Refund>> {
        if let Some(err) = self.enter(Self::FIND_REFUND)? {
            return Err(err);
        }
        let state = self.state();
        Ok(state
            .refunds
            .iter()
            .map(|(_, r)| r)
            .find(|r| r.payment_intent_id == payment_intent_id)
            .cloned())
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProcessorResult<CheckoutSession> {
        if let Some(err) = self.enter(Self::RETRIEVE_SESSION)? {
            return Err(err);
        }
        self.state()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProcessorError::not_found("checkout session", session_id))
    }

    async fn retrieve_account(&self, account_id: &str) -> ProcessorResult<ConnectedAccount> {
        if let Some(err) = self.enter(Self::RETRIEVE_ACCOUNT)? {
            return Err(err);
        }
        self.state()
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| ProcessorError::not_found("account", account_id))
    }

    async fn create_transfer(&self, request: &TransferRequest) -> ProcessorResult<Transfer> {
        let late_failure = self.enter(Self::CREATE_TRANSFER)?;
        let mut state = self.state();

        let transfer = match state
            .transfers
            .iter()
            .find(|(req, _)| req.idempotency_key == request.idempotency_key)
        {
            Some((_, existing)) => existing.clone(),
            None => {
                let transfer = Transfer {
                    id: format!("tr_mock_{}", Uuid::new_v4().simple()),
                    amount: request.amount,
                    destination: request.destination.clone(),
                };
                state.transfers.push((request.clone(), transfer.clone()));
                transfer
            }
        };

        match late_failure {
            Some(err) => Err(err),
            None => Ok(transfer),
        }
    }
}
