use uuid::Uuid;

use crate::{
    EngineError, ResultEngine, TransactionStatus, events::Event, gateway::PaymentRequest,
};

use super::BillPaymentSaga;

impl BillPaymentSaga {
    /// Phase 2: call the provider and record the outcome.
    ///
    /// Safe to run more than once for the same transaction. A transaction
    /// that already reached a terminal status is left alone, and one already
    /// `PROCESSING` (an earlier attempt died mid-call) goes straight to the
    /// provider, which deduplicates on `request.reference`.
    ///
    /// An `Err` from the provider bubbles up so the queue retries; the row
    /// stays `PROCESSING` until the last attempt fails.
    pub(super) async fn process_bill_payment(
        &self,
        transaction_id: Uuid,
        request: &PaymentRequest,
        attempt: u32,
    ) -> ResultEngine<()> {
        let current = self.transactions.get_any(&self.database, transaction_id).await?;
        match current.status {
            TransactionStatus::Pending => {
                self.transactions
                    .advance(
                        &self.database,
                        transaction_id,
                        TransactionStatus::Processing,
                        None,
                        None,
                    )
                    .await?;
            }
            TransactionStatus::Processing => {
                tracing::info!(%transaction_id, attempt, "resuming settlement");
            }
            status => {
                tracing::info!(
                    %transaction_id,
                    status = status.as_str(),
                    "transaction already settled, skipping"
                );
                return Ok(());
            }
        }

        let response = self
            .gateway
            .process_payment(request)
            .await
            .inspect_err(|err| {
                tracing::warn!(%transaction_id, attempt, error = %err, "provider call failed");
            })?;

        if response.success {
            self.transactions
                .advance(
                    &self.database,
                    transaction_id,
                    TransactionStatus::Completed,
                    Some(&response.transaction_id),
                    None,
                )
                .await?;
            tracing::info!(
                %transaction_id,
                external_reference = %response.transaction_id,
                "bill payment completed"
            );
            self.events.publish(Event::PaymentSucceeded {
                transaction_id,
                external_reference: response.transaction_id,
                data: response.data,
            });
            return Ok(());
        }

        self.fail_payment(transaction_id, &response.message).await
    }

    /// Mark a bill payment `FAILED` and announce it so compensation runs.
    pub(super) async fn fail_payment(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> ResultEngine<()> {
        self.transactions
            .advance(
                &self.database,
                transaction_id,
                TransactionStatus::Failed,
                None,
                Some(reason),
            )
            .await?;
        tracing::warn!(%transaction_id, reason, "bill payment failed");
        self.events.publish(Event::PaymentFailed {
            transaction_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Settlement will not be attempted again. Fail the payment unless it
    /// already settled, so the reserved funds get released.
    pub(super) async fn settlement_exhausted(
        &self,
        transaction_id: Uuid,
        error: &EngineError,
    ) -> ResultEngine<()> {
        let current = self.transactions.get_any(&self.database, transaction_id).await?;
        if !matches!(
            current.status,
            TransactionStatus::Pending | TransactionStatus::Processing
        ) {
            return Ok(());
        }
        self.fail_payment(transaction_id, &error.to_string()).await
    }
}
