use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::models::SubscriptionStatus;
use clubhouse_core::payment::{
    CheckoutPaymentStatus, CheckoutSession, ConnectedAccount, PaymentProcessor, ProcessorError,
    ProcessorResult, ProcessorSubscription, Refund, RefundRequest, Transfer, TransferRequest,
};
use clubhouse_core::Money;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::app_config::ProcessorConfig;

/// Stripe REST client. Requests are form-encoded; writes carry an
/// `Idempotency-Key` so retries never double-apply.
pub struct StripeProcessor {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl StripeProcessor {
    pub fn new(config: &ProcessorConfig) -> Result<Self, ProcessorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("clubhouse-ledger/0.1.0")
            .build()
            .map_err(|e| ProcessorError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> ProcessorResult<T> {
        debug!(path, "GET processor resource");
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        idempotency_key: &str,
        form: &[(String, String)],
    ) -> ProcessorResult<T> {
        debug!(path, idempotency_key, "POST processor resource");
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }
}

fn transport_error(err: reqwest::Error) -> ProcessorError {
    if err.is_timeout() {
        ProcessorError::Timeout
    } else {
        ProcessorError::Network(err.to_string())
    }
}

async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> ProcessorResult<T> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(api_error(status.as_u16(), &body));
    }
    serde_json::from_str::<T>(&body).map_err(|e| ProcessorError::InvalidResponse(e.to_string()))
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Decodes Stripe's `{"error": {...}}` body, falling back to the raw text.
fn api_error(status: u16, body: &str) -> ProcessorError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => ProcessorError::Api {
            status,
            code: envelope.error.code,
            message: envelope.error.message.unwrap_or_else(|| "no message".to_string()),
        },
        Err(_) => ProcessorError::Api {
            status,
            code: None,
            message: body.chars().take(200).collect(),
        },
    }
}

fn with_metadata(mut form: Vec<(String, String)>, metadata: &BTreeMap<String, String>) -> Vec<(String, String)> {
    form.extend(
        metadata
            .iter()
            .map(|(key, value)| (format!("metadata[{}]", key), value.clone())),
    );
    form
}

// Wire shapes. Only the fields the ledger reads are declared.

#[derive(Deserialize)]
struct WirePaymentIntent {
    latest_charge: Option<WireCharge>,
}

#[derive(Deserialize)]
struct WireCharge {
    balance_transaction: Option<WireBalanceTransaction>,
}

#[derive(Deserialize)]
struct WireBalanceTransaction {
    fee: Money,
}

#[derive(Deserialize)]
struct WireRefund {
    id: String,
    payment_intent: Option<String>,
    amount: Money,
    status: Option<String>,
}

#[derive(Deserialize)]
struct WireList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct WireSession {
    id: String,
    payment_status: CheckoutPaymentStatus,
    subscription: Option<WireSubscription>,
}

#[derive(Deserialize)]
struct WireSubscription {
    id: String,
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
}

#[derive(Deserialize)]
struct WireAccount {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
}

#[derive(Deserialize)]
struct WireTransfer {
    id: String,
    amount: Money,
    destination: String,
}

impl WireRefund {
    fn into_refund(self, fallback_intent: &str) -> Refund {
        Refund {
            id: self.id,
            payment_intent_id: self.payment_intent.unwrap_or_else(|| fallback_intent.to_string()),
            amount: self.amount,
            status: self.status.unwrap_or_else(|| "pending".to_string()),
        }
    }
}

impl WireSubscription {
    fn into_subscription(self) -> ProcessorResult<ProcessorSubscription> {
        let status = self
            .status
            .parse::<SubscriptionStatus>()
            .map_err(ProcessorError::InvalidResponse)?;
        let current_period_end = self
            .current_period_end
            .map(|secs| {
                DateTime::<Utc>::from_timestamp(secs, 0)
                    .ok_or_else(|| ProcessorError::InvalidResponse(format!("bad timestamp {}", secs)))
            })
            .transpose()?;
        Ok(ProcessorSubscription {
            id: self.id,
            status,
            current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
        })
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn charge_fee(&self, payment_intent_id: &str) -> ProcessorResult<Money> {
        let intent: WirePaymentIntent = self
            .get(
                &format!("/v1/payment_intents/{}", payment_intent_id),
                &[("expand[]", "latest_charge.balance_transaction")],
            )
            .await?;
        intent
            .latest_charge
            .and_then(|charge| charge.balance_transaction)
            .map(|txn| txn.fee)
            .ok_or_else(|| {
                ProcessorError::InvalidResponse(format!("payment {} has no settled charge", payment_intent_id))
            })
    }

    async fn create_refund(&self, request: &RefundRequest) -> ProcessorResult<Refund> {
        let form = with_metadata(
            vec![
                ("payment_intent".to_string(), request.payment_intent_id.clone()),
                ("amount".to_string(), request.amount.to_string()),
            ],
            &request.metadata,
        );
        let refund: WireRefund = self.post("/v1/refunds", &request.idempotency_key, &form).await?;
        Ok(refund.into_refund(&request.payment_intent_id))
    }

    async fn find_refund(&self, payment_intent_id: &str) -> ProcessorResult<Option<Refund>> {
        let list: WireList<WireRefund> = self
            .get("/v1/refunds", &[("payment_intent", payment_intent_id), ("limit", "1")])
            .await?;
        Ok(list
            .data
            .into_iter()
            .next()
            .map(|r| r.into_refund(payment_intent_id)))
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProcessorResult<CheckoutSession> {
        let session: WireSession = self
            .get(
                &format!("/v1/checkout/sessions/{}", session_id),
                &[("expand[]", "subscription")],
            )
            .await?;
        Ok(CheckoutSession {
            id: session.id,
            payment_status: session.payment_status,
            subscription: session.subscription.map(WireSubscription::into_subscription).transpose()?,
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> ProcessorResult<ConnectedAccount> {
        let account: WireAccount = self.get(&format!("/v1/accounts/{}", account_id), &[]).await?;
        Ok(ConnectedAccount {
            id: account.id,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
        })
    }

    async fn create_transfer(&self, request: &TransferRequest) -> ProcessorResult<Transfer> {
        let form = with_metadata(
            vec![
                ("amount".to_string(), request.amount.to_string()),
                ("currency".to_string(), request.currency.clone()),
                ("destination".to_string(), request.destination.clone()),
            ],
            &request.metadata,
        );
        let transfer: WireTransfer = self.post("/v1/transfers", &request.idempotency_key, &form).await?;
        Ok(Transfer {
            id: transfer.id,
            amount: transfer.amount,
            destination: transfer.destination,
        })
    }
}
