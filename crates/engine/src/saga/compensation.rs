use std::sync::Arc;

use chrono::Utc;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use uuid::Uuid;

use crate::{ResultEngine, events::Event, queue::Job};

use super::BillPaymentSaga;

impl BillPaymentSaga {
    /// Phase 3: turn every `payment.failed` event into a reversal job.
    ///
    /// The subscription is taken before this returns, so no event published
    /// afterwards is missed. Events dropped because the listener lagged are
    /// picked up by [`reconcile_failed`](Self::reconcile_failed).
    pub fn spawn_compensation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.events.subscribe();
        let saga = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::PaymentFailed {
                        transaction_id,
                        reason,
                    }) => {
                        if let Err(err) = saga.schedule_reversal(transaction_id, Some(reason)) {
                            tracing::error!(%transaction_id, error = %err, "could not schedule reversal");
                        }
                    }
                    Ok(event) => {
                        tracing::debug!(
                            event = event.name(),
                            transaction_id = %event.transaction_id(),
                            "event observed"
                        );
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "compensation listener lagged; reconciliation will catch up");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("compensation listener stopped");
        })
    }

    /// Queue a reversal for a failed payment, honoring the configured
    /// initial delay.
    pub fn schedule_reversal(
        &self,
        transaction_id: Uuid,
        reason: Option<String>,
    ) -> ResultEngine<()> {
        self.queue.enqueue(
            Job::ProcessReversal {
                transaction_id,
                reason,
            },
            self.config.reversal,
        )?;
        tracing::info!(%transaction_id, "reversal scheduled");
        Ok(())
    }

    /// Schedule a reversal for every failed bill payment that has none and
    /// has been failed for longer than the grace period. Returns how many
    /// were scheduled.
    ///
    /// Reversal is idempotent, so sweeping a payment whose event-driven
    /// reversal is still queued costs one no-op job.
    pub async fn reconcile_failed(&self) -> ResultEngine<usize> {
        let grace = chrono::Duration::seconds(i64::from(
            u32::try_from(self.config.reconcile_grace_secs).unwrap_or(u32::MAX),
        ));
        let older_than = Utc::now() - grace;
        let stuck = self
            .transactions
            .failed_unreversed(&self.database, older_than)
            .await?;

        for transaction in &stuck {
            self.schedule_reversal(transaction.id, transaction.failure_reason.clone())?;
        }
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "reconciliation scheduled missed reversals");
        }
        Ok(stuck.len())
    }

    /// Run [`reconcile_failed`](Self::reconcile_failed) on a fixed interval.
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let saga = Arc::clone(self);
        let period = self.reconcile_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = saga.reconcile_failed().await {
                    tracing::error!(error = %err, "reconciliation sweep failed");
                }
            }
        })
    }
}
