use clubhouse_core::models::DebitOutcome;
use clubhouse_core::repository::WalletRepository;
use clubhouse_core::{AuthenticatedUser, LedgerError, LedgerResult, Money, StoreError};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Debits a subscriber's partner-scoped wallet. The user always comes from
/// the verified token; balance check and debit happen in one store call.
pub struct WalletDebitProcessor {
    wallets: Arc<dyn WalletRepository>,
}

impl WalletDebitProcessor {
    pub fn new(wallets: Arc<dyn WalletRepository>) -> Self {
        Self { wallets }
    }

    pub async fn debit(
        &self,
        caller: &AuthenticatedUser,
        partner_id: Uuid,
        amount: Money,
    ) -> LedgerResult<DebitOutcome> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "Debit amount must be positive, got {}",
                amount
            )));
        }

        let outcome = match self.wallets.debit(caller.user_id, partner_id, amount).await {
            Ok(outcome) => outcome,
            Err(StoreError::NotFound(_)) => return Err(LedgerError::not_found("partner", partner_id)),
            Err(e) => return Err(e.into()),
        };

        match &outcome {
            DebitOutcome::Completed(tx) => {
                info!(
                    transaction_id = %tx.id,
                    user_id = %caller.user_id,
                    %partner_id,
                    amount,
                    balance_after = tx.balance_after,
                    "Wallet debited"
                );
            }
            DebitOutcome::InsufficientFunds { balance, requested } => {
                warn!(user_id = %caller.user_id, %partner_id, balance, requested, "Wallet debit declined");
            }
        }
        Ok(outcome)
    }
}
