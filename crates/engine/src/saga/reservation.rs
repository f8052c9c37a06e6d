use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    EngineError, MoneyCents, ResultEngine, Transaction, TransactionKind, TransactionStatus,
    gateway::PaymentRequest,
    queue::Job,
    util::{new_reference, normalize_required},
};

use super::{BillPaymentSaga, with_tx};

/// What the caller wants paid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillPayment {
    pub bill_type: String,
    pub amount: MoneyCents,
    pub customer_reference: String,
    pub metadata: Option<serde_json::Value>,
}

/// Phase 1 outcome: funds are held and settlement is queued.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BillPaymentAccepted {
    pub transaction_id: Uuid,
    pub reference: String,
    /// Always [`TransactionStatus::Processing`] from the caller's point of
    /// view, even though the stored row is still `PENDING`.
    pub status: TransactionStatus,
}

impl BillPaymentSaga {
    /// Reserve funds for a bill and queue the provider call.
    ///
    /// The debit and the `PENDING` record commit together or not at all.
    /// The provider is never called from here.
    pub async fn pay_bill(
        &self,
        user_id: &str,
        payment: BillPayment,
    ) -> ResultEngine<BillPaymentAccepted> {
        let bill_type = normalize_required(&payment.bill_type, "bill type")?;
        let customer_reference =
            normalize_required(&payment.customer_reference, "customer reference")?;
        let amount = payment.amount.require_positive("amount")?;

        let wallet = self.wallets.wallet_by_user(&self.database, user_id).await?;
        // Fast path; the version-checked debit re-checks the balance.
        if wallet.balance < amount {
            tracing::info!(
                user_id,
                %amount,
                balance = %wallet.balance,
                "bill payment rejected: insufficient funds"
            );
            return Err(EngineError::InsufficientFunds(format!(
                "balance {} is lower than {}",
                wallet.balance, amount
            )));
        }

        let reference = new_reference("BILL");
        let metadata = bill_metadata(user_id, &bill_type, &customer_reference, payment.metadata);
        let transaction = self
            .retry_on_conflict("reserve", || {
                self.reserve(wallet.id, amount, &reference, metadata.clone())
            })
            .await?;

        let request = PaymentRequest {
            bill_type,
            amount,
            customer_reference,
            reference: reference.clone(),
            metadata: transaction.metadata.clone(),
        };
        self.queue
            .enqueue(
                Job::ProcessBillPayment {
                    transaction_id: transaction.id,
                    request,
                },
                self.config.bill_payment,
            )
            .inspect_err(|err| {
                tracing::error!(
                    transaction_id = %transaction.id,
                    %reference,
                    error = %err,
                    "funds reserved but settlement could not be queued"
                );
            })?;

        tracing::info!(
            transaction_id = %transaction.id,
            %reference,
            user_id,
            %amount,
            "bill payment accepted"
        );
        Ok(BillPaymentAccepted {
            transaction_id: transaction.id,
            reference,
            status: TransactionStatus::Processing,
        })
    }

    async fn reserve(
        &self,
        wallet_id: Uuid,
        amount: MoneyCents,
        reference: &str,
        metadata: serde_json::Value,
    ) -> ResultEngine<Transaction> {
        with_tx!(self, |db_tx| {
            self.wallets
                .debit(&db_tx, wallet_id, amount, reference)
                .await?;
            let transaction = self
                .transactions
                .record(
                    &db_tx,
                    wallet_id,
                    -amount,
                    TransactionKind::BillPayment,
                    reference,
                    Some(metadata),
                )
                .await?;
            Ok(transaction)
        })
    }
}

/// Caller metadata plus the bill fields. The bill fields win on a clash;
/// a non-object payload is kept under `extra`.
fn bill_metadata(
    user_id: &str,
    bill_type: &str,
    customer_reference: &str,
    extra: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut merged = match extra {
        Some(serde_json::Value::Object(map)) => map,
        Some(serde_json::Value::Null) | None => serde_json::Map::new(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("extra".to_string(), other);
            map
        }
    };
    merged.insert("userId".to_string(), user_id.into());
    merged.insert("billType".to_string(), bill_type.into());
    merged.insert("customerReference".to_string(), customer_reference.into());
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::bill_metadata;

    #[test]
    fn bill_fields_override_caller_metadata() {
        let merged = bill_metadata(
            "user-1",
            "electricity",
            "METER1",
            Some(json!({ "billType": "spoofed", "note": "march" })),
        );
        assert_eq!(
            merged,
            json!({
                "userId": "user-1",
                "billType": "electricity",
                "customerReference": "METER1",
                "note": "march",
            })
        );
    }

    #[test]
    fn scalar_metadata_is_kept_aside() {
        let merged = bill_metadata("u", "water", "C1", Some(json!("free text")));
        assert_eq!(merged["extra"], "free text");
        assert_eq!(merged["billType"], "water");
    }
}
