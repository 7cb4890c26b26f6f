use clubhouse_core::models::{SubscriptionState, SubscriptionStatus};
use clubhouse_core::payment::PaymentProcessor;
use clubhouse_core::repository::SubscriptionRepository;
use clubhouse_core::{LedgerError, LedgerResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::notifications::Notifier;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Payment has not completed yet; the caller should poll again.
    Pending { session_id: String },
    Synced {
        subscription_id: Uuid,
        status: SubscriptionStatus,
        changed: bool,
        welcome_sent: bool,
    },
}

/// Reconciles the local subscription record with the processor after checkout.
pub struct SubscriptionSynchronizer {
    subscriptions: Arc<dyn SubscriptionRepository>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Notifier,
    retry: RetryPolicy,
}

impl SubscriptionSynchronizer {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Notifier,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            subscriptions,
            processor,
            notifier,
            retry,
        }
    }

    pub async fn verify(&self, session_id: &str) -> LedgerResult<SyncOutcome> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(LedgerError::Validation("session_id is required".to_string()));
        }

        let processor = self.processor.as_ref();
        let session = self
            .retry
            .run("retrieve_checkout_session", move || {
                processor.retrieve_checkout_session(session_id)
            })
            .await?;

        if !session.payment_status.is_confirmed() {
            info!(session_id, payment_status = ?session.payment_status, "Checkout not paid yet");
            return Ok(SyncOutcome::Pending {
                session_id: session_id.to_string(),
            });
        }

        let remote = session.subscription.ok_or_else(|| {
            LedgerError::Validation("Checkout session has no subscription attached".to_string())
        })?;

        let local = self
            .subscriptions
            .find_by_external_id(&remote.id)
            .await?
            .ok_or_else(|| {
                warn!(external_id = %remote.id, "Subscription missing locally; waiting for webhook sync");
                LedgerError::NotFound {
                    entity: "subscription",
                    id: remote.id.clone(),
                    needs_sync: true,
                }
            })?;

        let desired = SubscriptionState {
            status: remote.status,
            current_period_end: remote.current_period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
        };
        let changed = local.state() != desired;
        if changed {
            self.subscriptions.update_state(local.id, &desired).await?;
            info!(
                subscription_id = %local.id,
                from = %local.status,
                to = %desired.status,
                "Subscription state synced from processor"
            );
        }

        // Gated on the marker alone: a webhook may already have activated the record.
        let mut welcome_sent = false;
        if desired.status == SubscriptionStatus::Active && self.subscriptions.claim_welcome(local.id).await? {
            welcome_sent = self
                .notifier
                .deliver(self.notifier.welcome(&local), "welcome")
                .await;
        }

        Ok(SyncOutcome::Synced {
            subscription_id: local.id,
            status: desired.status,
            changed,
            welcome_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use clubhouse_core::payment::{CheckoutPaymentStatus, CheckoutSession, ProcessorSubscription};
    use clubhouse_core::MockPaymentProcessor;
    use clubhouse_store::InMemoryStore;

    struct Harness {
        store: Arc<InMemoryStore>,
        processor: Arc<MockPaymentProcessor>,
        service: SubscriptionSynchronizer,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let service = SubscriptionSynchronizer::new(
            store.clone(),
            processor.clone(),
            Notifier::new(store.clone(), "eur"),
            RetryPolicy::no_retry(),
        );
        Harness {
            store,
            processor,
            service,
        }
    }

    fn session(id: &str, paid: bool, sub_id: &str, status: SubscriptionStatus) -> CheckoutSession {
        CheckoutSession {
            id: id.to_string(),
            payment_status: if paid {
                CheckoutPaymentStatus::Paid
            } else {
                CheckoutPaymentStatus::Unpaid
            },
            subscription: Some(ProcessorSubscription {
                id: sub_id.to_string(),
                status,
                current_period_end: None,
                cancel_at_period_end: false,
            }),
        }
    }

    #[tokio::test]
    async fn test_activation_sends_welcome_once() {
        let h = harness();
        let local = testing::subscription("sub_1", SubscriptionStatus::Incomplete);
        h.store.seed_subscription(local.clone());
        h.processor
            .add_session(session("cs_1", true, "sub_1", SubscriptionStatus::Active));

        let first = h.service.verify("cs_1").await.unwrap();
        let second = h.service.verify("cs_1").await.unwrap();

        match first {
            SyncOutcome::Synced {
                changed,
                welcome_sent,
                status,
                ..
            } => {
                assert!(changed);
                assert!(welcome_sent);
                assert_eq!(status, SubscriptionStatus::Active);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        match second {
            SyncOutcome::Synced {
                changed, welcome_sent, ..
            } => {
                assert!(!changed);
                assert!(!welcome_sent);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.store.subscription(local.id).unwrap().status, SubscriptionStatus::Active);
        assert_eq!(h.store.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_already_active_record_gets_one_welcome() {
        let h = harness();
        let local = testing::subscription("sub_5", SubscriptionStatus::Active);
        h.store.seed_subscription(local.clone());
        h.processor
            .add_session(session("cs_5", true, "sub_5", SubscriptionStatus::Active));

        h.service.verify("cs_5").await.unwrap();
        h.service.verify("cs_5").await.unwrap();

        assert_eq!(h.store.emails().len(), 1);
        assert!(h.store.subscription(local.id).unwrap().welcome_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_unpaid_session_is_pending() {
        let h = harness();
        h.processor
            .add_session(session("cs_2", false, "sub_2", SubscriptionStatus::Incomplete));

        let outcome = h.service.verify("cs_2").await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Pending { .. }));
        assert!(h.store.emails().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_record_needs_sync() {
        let h = harness();
        h.processor
            .add_session(session("cs_3", true, "sub_unknown", SubscriptionStatus::Active));

        let result = h.service.verify("cs_3").await;

        assert!(matches!(
            result,
            Err(LedgerError::NotFound {
                entity: "subscription",
                needs_sync: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_status_mirrors_processor_without_welcome() {
        let h = harness();
        let local = testing::subscription("sub_4", SubscriptionStatus::Active);
        h.store.seed_subscription(local.clone());
        h.processor
            .add_session(session("cs_4", true, "sub_4", SubscriptionStatus::PastDue));

        h.service.verify("cs_4").await.unwrap();

        assert_eq!(h.store.subscription(local.id).unwrap().status, SubscriptionStatus::PastDue);
        assert!(h.store.emails().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_external_error() {
        let h = harness();
        let result = h.service.verify("cs_missing").await;
        assert!(matches!(result, Err(LedgerError::External(_))));
        assert!(matches!(h.service.verify("  ").await, Err(LedgerError::Validation(_))));
    }
}
