use sea_orm::TransactionTrait;
use uuid::Uuid;

use crate::{
    EngineError, ResultEngine, Transaction, TransactionKind, TransactionStatus, Wallet,
    util::new_reference,
};

use super::{BillPaymentSaga, with_tx};

#[derive(Clone, Debug, PartialEq)]
pub enum ReversalOutcome {
    /// Funds went back to the wallet in this run.
    Reversed {
        reversal: Transaction,
        wallet: Wallet,
    },
    /// An earlier run already did it.
    AlreadyReversed,
}

impl BillPaymentSaga {
    /// Phase 4: give a failed payment's funds back.
    ///
    /// The credit, the `REVERSAL` record, the original's move to `REVERSED`
    /// and the link between the two commit together. Running it again for
    /// the same transaction credits nothing.
    pub async fn process_reversal(
        &self,
        transaction_id: Uuid,
        reason: Option<&str>,
    ) -> ResultEngine<ReversalOutcome> {
        let outcome = self
            .retry_on_conflict("reversal", || self.reverse_once(transaction_id, reason))
            .await;
        if let Err(EngineError::KeyNotFound(_)) = &outcome {
            tracing::error!(%transaction_id, "transaction to reverse does not exist");
        }
        outcome
    }

    async fn reverse_once(
        &self,
        transaction_id: Uuid,
        reason: Option<&str>,
    ) -> ResultEngine<ReversalOutcome> {
        with_tx!(self, |db_tx| {
            let original = self.transactions.get_any(&db_tx, transaction_id).await?;
            match original.status {
                TransactionStatus::Failed => {}
                TransactionStatus::Reversed => {
                    tracing::info!(%transaction_id, "transaction already reversed");
                    return Ok(ReversalOutcome::AlreadyReversed);
                }
                status => {
                    return Err(EngineError::InvalidStateTransition(format!(
                        "cannot reverse a {} transaction",
                        status.as_str()
                    )));
                }
            }

            let amount = original.amount.abs();
            let reference = new_reference("REV");
            let wallet = self
                .wallets
                .credit(&db_tx, original.wallet_id, amount, &reference)
                .await?;
            let reversal = self
                .transactions
                .record(
                    &db_tx,
                    original.wallet_id,
                    amount,
                    TransactionKind::Reversal,
                    &reference,
                    Some(serde_json::json!({
                        "originalTransactionId": transaction_id,
                        "originalReference": original.reference,
                        "reason": reason,
                    })),
                )
                .await?;
            let reversal = self
                .transactions
                .advance(&db_tx, reversal.id, TransactionStatus::Completed, None, None)
                .await?;
            self.transactions
                .advance(
                    &db_tx,
                    transaction_id,
                    TransactionStatus::Reversed,
                    None,
                    reason,
                )
                .await?;
            self.transactions
                .link_reversal(&db_tx, transaction_id, reversal.id)
                .await?;

            tracing::info!(
                %transaction_id,
                reversal_id = %reversal.id,
                %amount,
                balance = %wallet.balance,
                "transaction reversed"
            );
            Ok(ReversalOutcome::Reversed { reversal, wallet })
        })
    }
}
