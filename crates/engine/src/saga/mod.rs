use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::{
    EngineError, MoneyCents, ResultEngine, Transaction, TransactionKind, TransactionLedger,
    TransactionStatus, Wallet, WalletLedger,
    events::EventBus,
    gateway::{PaymentGateway, SimulatedGateway},
    queue::{
        DeadLetter, Job, JobFuture, JobHandler, JobOptions, JobOptionsOverride, JobQueue,
        JobReceiver, WorkerPool,
    },
    util::new_reference,
};

mod compensation;
mod reservation;
mod reversal;
mod settlement;

pub use reservation::{BillPayment, BillPaymentAccepted};
pub use reversal::ReversalOutcome;

/// Run a block inside a DB transaction, committing on success and rolling back on error.
macro_rules! with_tx {
    ($self:expr, |$tx:ident| $body:expr) => {{
        let $tx = $self.database.begin().await?;
        let result = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }};
}

pub(crate) use with_tx;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Concurrent job workers.
    pub workers: usize,
    /// How many times an atomic unit is re-run after losing an optimistic
    /// lock, on top of the first run.
    pub conflict_retries: u32,
    #[serde(deserialize_with = "bill_payment_options")]
    pub bill_payment: JobOptions,
    #[serde(deserialize_with = "reversal_options")]
    pub reversal: JobOptions,
    pub reconcile_interval_secs: u64,
    /// Failed payments younger than this are left to the event path.
    pub reconcile_grace_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            conflict_retries: 3,
            bill_payment: JobOptions::bill_payment(),
            reversal: JobOptions::reversal(),
            reconcile_interval_secs: 60,
            reconcile_grace_secs: 30,
        }
    }
}

fn bill_payment_options<'de, D: Deserializer<'de>>(d: D) -> Result<JobOptions, D::Error> {
    JobOptionsOverride::deserialize(d).map(|o| o.over(JobOptions::bill_payment()))
}

fn reversal_options<'de, D: Deserializer<'de>>(d: D) -> Result<JobOptions, D::Error> {
    JobOptionsOverride::deserialize(d).map(|o| o.over(JobOptions::reversal()))
}

/// Coordinates a bill payment across the wallet, the audit trail and the
/// external provider.
///
/// 1. Reserve: debit and record `PENDING` atomically, enqueue settlement.
/// 2. Settle: a worker calls the provider and moves the record to
///    `COMPLETED` or `FAILED`.
/// 3. Compensate: a `payment.failed` event enqueues a reversal.
/// 4. Reverse: credit the amount back and mark the original `REVERSED`.
pub struct BillPaymentSaga {
    database: DatabaseConnection,
    wallets: WalletLedger,
    transactions: TransactionLedger,
    events: EventBus,
    queue: JobQueue,
    receiver: Mutex<Option<JobReceiver>>,
    gateway: Arc<dyn PaymentGateway>,
    config: SagaConfig,
}

impl std::fmt::Debug for BillPaymentSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillPaymentSaga")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BillPaymentSaga {
    /// Return a builder for `BillPaymentSaga`. Help to build the struct.
    pub fn builder() -> SagaBuilder {
        SagaBuilder::default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters()
    }

    /// Start the job workers. Only the first call succeeds.
    pub fn start_workers(self: &Arc<Self>) -> ResultEngine<WorkerPool> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                EngineError::Validation("job workers are already running".to_string())
            })?;
        let pool = WorkerPool::spawn(
            self.queue.clone(),
            receiver,
            Arc::clone(self),
            self.config.workers,
        );
        tracing::info!(workers = pool.len(), "job workers started");
        Ok(pool)
    }

    /// Credit `amount` to the user's wallet, creating it if needed, and
    /// record a completed `FUNDING` transaction in the same atomic unit.
    pub async fn fund_wallet(&self, user_id: &str, amount: MoneyCents) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;
        let reference = new_reference("FUND");
        self.retry_on_conflict("fund", || self.fund_once(user_id, amount, &reference))
            .await
    }

    async fn fund_once(
        &self,
        user_id: &str,
        amount: MoneyCents,
        reference: &str,
    ) -> ResultEngine<Wallet> {
        with_tx!(self, |db_tx| {
            let wallet = self.wallets.fund(&db_tx, user_id, amount).await?;
            let funding = self
                .transactions
                .record(
                    &db_tx,
                    wallet.id,
                    amount,
                    TransactionKind::Funding,
                    reference,
                    Some(serde_json::json!({ "userId": user_id })),
                )
                .await?;
            self.transactions
                .advance(&db_tx, funding.id, TransactionStatus::Completed, None, None)
                .await?;
            Ok(wallet)
        })
    }

    pub async fn wallet_for_user(&self, user_id: &str) -> ResultEngine<Wallet> {
        self.wallets.wallet_by_user(&self.database, user_id).await
    }

    pub async fn transactions_for_user(&self, user_id: &str) -> ResultEngine<Vec<Transaction>> {
        self.transactions.list_by_user(&self.database, user_id).await
    }

    /// A transaction of the user's wallet. Someone else's transaction is
    /// reported as missing.
    pub async fn transaction_for_user(
        &self,
        user_id: &str,
        transaction_id: Uuid,
    ) -> ResultEngine<Transaction> {
        let wallet = self.wallets.wallet_by_user(&self.database, user_id).await?;
        let transaction = self.transactions.get(&self.database, transaction_id).await?;
        if transaction.wallet_id != wallet.id {
            return Err(EngineError::KeyNotFound("transaction not exists".to_string()));
        }
        Ok(transaction)
    }

    /// Run `op` again while it fails with [`EngineError::Conflict`], up to
    /// `conflict_retries` extra times. `op` must be a whole atomic unit so
    /// every run starts from a fresh read.
    async fn retry_on_conflict<T, F, Fut>(&self, operation: &str, op: F) -> ResultEngine<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResultEngine<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Err(EngineError::Conflict(reason)) if retries < self.config.conflict_retries => {
                    retries += 1;
                    tracing::debug!(operation, retries, %reason, "optimistic lock lost, retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.config.reconcile_interval_secs.max(1))
    }
}

impl JobHandler for BillPaymentSaga {
    fn handle<'a>(&'a self, job: &'a Job, attempt: u32) -> JobFuture<'a> {
        Box::pin(async move {
            match job {
                Job::ProcessBillPayment {
                    transaction_id,
                    request,
                } => {
                    self.process_bill_payment(*transaction_id, request, attempt)
                        .await
                }
                Job::ProcessReversal {
                    transaction_id,
                    reason,
                } => self
                    .process_reversal(*transaction_id, reason.as_deref())
                    .await
                    .map(|_| ()),
            }
        })
    }

    fn exhausted<'a>(&'a self, job: &'a Job, error: &'a EngineError) -> JobFuture<'a> {
        Box::pin(async move {
            match job {
                Job::ProcessBillPayment { transaction_id, .. } => {
                    self.settlement_exhausted(*transaction_id, error).await
                }
                Job::ProcessReversal { transaction_id, .. } => {
                    tracing::error!(
                        %transaction_id,
                        error = %error,
                        "reversal exhausted; manual intervention required"
                    );
                    Ok(())
                }
            }
        })
    }
}

/// The builder for `BillPaymentSaga`
#[derive(Default)]
pub struct SagaBuilder {
    database: DatabaseConnection,
    gateway: Option<Arc<dyn PaymentGateway>>,
    events: Option<EventBus>,
    config: SagaConfig,
}

impl SagaBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> SagaBuilder {
        self.database = db;
        self
    }

    /// Payment provider. Defaults to [`SimulatedGateway`].
    pub fn gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> SagaBuilder {
        self.gateway = Some(gateway);
        self
    }

    pub fn events(mut self, events: EventBus) -> SagaBuilder {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: SagaConfig) -> SagaBuilder {
        self.config = config;
        self
    }

    /// Construct `BillPaymentSaga`
    pub async fn build(self) -> ResultEngine<BillPaymentSaga> {
        if let DatabaseConnection::Disconnected = self.database {
            return Err(EngineError::Validation(
                "a database connection is required".to_string(),
            ));
        }
        let events = self.events.unwrap_or_default();
        let (queue, receiver) = JobQueue::new();
        Ok(BillPaymentSaga {
            database: self.database,
            wallets: WalletLedger::new(),
            transactions: TransactionLedger::new(events.clone()),
            events,
            queue,
            receiver: Mutex::new(Some(receiver)),
            gateway: self
                .gateway
                .unwrap_or_else(|| Arc::new(SimulatedGateway::default())),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backoff;

    #[test]
    fn partial_job_options_keep_their_kind_defaults() {
        let config: SagaConfig = serde_json::from_value(serde_json::json!({
            "workers": 2,
            "reversal": { "attempts": 7 },
            "bill_payment": { "backoff": "fixed", "backoff_ms": 100 },
        }))
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.reversal.attempts, 7);
        assert_eq!(config.reversal.delay_ms, 5_000);
        assert_eq!(config.reversal.backoff, Backoff::Exponential);
        assert_eq!(config.reversal.backoff_ms, 3_000);
        assert_eq!(config.bill_payment.attempts, 3);
        assert_eq!(config.bill_payment.backoff, Backoff::Fixed);
        assert_eq!(config.bill_payment.backoff_ms, 100);
        assert_eq!(config.bill_payment.delay_ms, 0);
    }
}
