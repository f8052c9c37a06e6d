//! In-process job queue with delayed delivery and bounded retries.
//!
//! Jobs travel over an unbounded channel and are drained by a fixed pool of
//! workers. A retryable failure re-enqueues the job after its backoff; once
//! the attempts run out (or the error is permanent) the handler's
//! [`JobHandler::exhausted`] hook runs and the job lands in the dead-letter
//! list. Nothing here survives a restart.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, gateway::PaymentRequest};

const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// Phase 2: call the provider for a reserved payment and settle it.
    ProcessBillPayment {
        transaction_id: Uuid,
        request: PaymentRequest,
    },
    /// Phase 4: compensate a failed payment.
    ProcessReversal {
        transaction_id: Uuid,
        reason: Option<String>,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessBillPayment { .. } => "process-bill-payment",
            Self::ProcessReversal { .. } => "process-reversal",
        }
    }

    pub fn transaction_id(&self) -> Uuid {
        match self {
            Self::ProcessBillPayment { transaction_id, .. }
            | Self::ProcessReversal { transaction_id, .. } => *transaction_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Delivery options attached to a job when it is enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub backoff: Backoff,
    pub backoff_ms: u64,
    /// Wait before the first attempt.
    #[serde(default)]
    pub delay_ms: u64,
}

impl JobOptions {
    pub const fn bill_payment() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential,
            backoff_ms: 2_000,
            delay_ms: 0,
        }
    }

    pub const fn reversal() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::Exponential,
            backoff_ms: 3_000,
            delay_ms: 5_000,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Wait before the next attempt, given how many attempts already failed.
    ///
    /// Exponential backoff doubles from the base: 1 failure waits `base`,
    /// 2 wait `2 * base`, 3 wait `4 * base`.
    pub fn backoff_after(&self, failed_attempts: u32) -> Duration {
        let base = Duration::from_millis(self.backoff_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let exponent = failed_attempts.saturating_sub(1).min(16);
                base.saturating_mul(1 << exponent)
            }
        }
    }
}

/// [`JobOptions`] as written in configuration. Fields left out keep the
/// value of the job kind's defaults.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct JobOptionsOverride {
    attempts: Option<u32>,
    backoff: Option<Backoff>,
    backoff_ms: Option<u64>,
    delay_ms: Option<u64>,
}

impl JobOptionsOverride {
    pub(crate) fn over(self, base: JobOptions) -> JobOptions {
        JobOptions {
            attempts: self.attempts.unwrap_or(base.attempts),
            backoff: self.backoff.unwrap_or(base.backoff),
            backoff_ms: self.backoff_ms.unwrap_or(base.backoff_ms),
            delay_ms: self.delay_ms.unwrap_or(base.delay_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = ResultEngine<()>> + Send + 'a>>;

/// Executes jobs pulled off the queue.
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt. `attempt` starts at 1.
    fn handle<'a>(&'a self, job: &'a Job, attempt: u32) -> JobFuture<'a>;

    /// Runs once when `job` will not be attempted again.
    fn exhausted<'a>(&'a self, job: &'a Job, error: &'a EngineError) -> JobFuture<'a>;
}

#[derive(Debug)]
struct Delivery {
    job: Job,
    options: JobOptions,
    attempt: u32,
}

#[derive(Clone, Debug)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    dead_letter_capacity: usize,
}

/// The draining end of a [`JobQueue`]; hand it to [`WorkerPool::spawn`].
#[derive(Debug)]
pub struct JobReceiver {
    inner: mpsc::UnboundedReceiver<Delivery>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }

    pub fn with_dead_letter_capacity(capacity: usize) -> (Self, JobReceiver) {
        let (sender, inner) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
            dead_letter_capacity: capacity.max(1),
        };
        (queue, JobReceiver { inner })
    }

    /// Enqueue `job`; it becomes visible to workers after `options.delay_ms`.
    pub fn enqueue(&self, job: Job, options: JobOptions) -> ResultEngine<()> {
        if self.sender.is_closed() {
            return Err(EngineError::ExternalService(
                "job queue is closed".to_string(),
            ));
        }
        tracing::debug!(
            job = job.name(),
            transaction_id = %job.transaction_id(),
            delay_ms = options.delay_ms,
            "job enqueued"
        );
        self.schedule(
            Delivery {
                job,
                options,
                attempt: 1,
            },
            options.delay(),
        );
        Ok(())
    }

    /// Snapshot of the dead-letter list, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn schedule(&self, delivery: Delivery, delay: Duration) {
        if delay.is_zero() {
            self.send(delivery);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.send(delivery);
        });
    }

    fn send(&self, delivery: Delivery) {
        if let Err(err) = self.sender.send(delivery) {
            let delivery = err.0;
            tracing::error!(
                job = delivery.job.name(),
                transaction_id = %delivery.job.transaction_id(),
                "job dropped: queue is closed"
            );
        }
    }

    fn bury(&self, job: Job, error: &EngineError, attempts: u32) {
        let mut dead_letters = self
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if dead_letters.len() >= self.dead_letter_capacity {
            dead_letters.pop_front();
        }
        dead_letters.push_back(DeadLetter {
            job,
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        });
    }
}

/// Fixed set of tasks draining one [`JobReceiver`].
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<H: JobHandler>(
        queue: JobQueue,
        receiver: JobReceiver,
        handler: Arc<H>,
        workers: usize,
    ) -> Self {
        let receiver = Arc::new(AsyncMutex::new(receiver.inner));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let receiver = receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(delivery) = next else {
                            break;
                        };
                        run(&queue, handler.as_ref(), delivery, worker).await;
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn run<H: JobHandler>(queue: &JobQueue, handler: &H, delivery: Delivery, worker: usize) {
    let Delivery {
        job,
        options,
        attempt,
    } = delivery;
    let transaction_id = job.transaction_id();

    let err = match handler.handle(&job, attempt).await {
        Ok(()) => {
            tracing::debug!(worker, job = job.name(), %transaction_id, attempt, "job done");
            return;
        }
        Err(err) => err,
    };

    if err.is_retryable() && attempt < options.attempts {
        let backoff = options.backoff_after(attempt);
        tracing::warn!(
            worker,
            job = job.name(),
            %transaction_id,
            attempt,
            attempts = options.attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "job failed, retrying"
        );
        queue.schedule(
            Delivery {
                job,
                options,
                attempt: attempt + 1,
            },
            backoff,
        );
        return;
    }

    tracing::error!(
        worker,
        job = job.name(),
        %transaction_id,
        attempt,
        error = %err,
        "job failed permanently"
    );
    if let Err(hook_err) = handler.exhausted(&job, &err).await {
        tracing::error!(
            job = job.name(),
            %transaction_id,
            error = %hook_err,
            "exhaustion hook failed"
        );
    }
    queue.bury(job, &err, attempt);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::MoneyCents;

    fn fast(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Backoff::Fixed,
            backoff_ms: 1,
            delay_ms: 0,
        }
    }

    fn reversal_job() -> Job {
        Job::ProcessReversal {
            transaction_id: Uuid::new_v4(),
            reason: Some("declined".to_string()),
        }
    }

    /// Fails `failures` times with `error()`, then succeeds.
    struct Flaky {
        failures: u32,
        error: fn() -> EngineError,
        calls: AtomicU32,
        exhausted: AtomicU32,
        settled: Notify,
    }

    impl Flaky {
        fn new(failures: u32, error: fn() -> EngineError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
                exhausted: AtomicU32::new(0),
                settled: Notify::new(),
            })
        }
    }

    impl JobHandler for Flaky {
        fn handle<'a>(&'a self, _job: &'a Job, attempt: u32) -> JobFuture<'a> {
            Box::pin(async move {
                let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(calls, attempt);
                if calls <= self.failures {
                    return Err((self.error)());
                }
                self.settled.notify_one();
                Ok(())
            })
        }

        fn exhausted<'a>(&'a self, _job: &'a Job, _error: &'a EngineError) -> JobFuture<'a> {
            Box::pin(async move {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
                self.settled.notify_one();
                Ok(())
            })
        }
    }

    async fn settle(handler: &Flaky) {
        tokio::time::timeout(Duration::from_secs(5), handler.settled.notified())
            .await
            .expect("job did not settle in time");
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let options = JobOptions::bill_payment();
        assert_eq!(options.backoff_after(1), Duration::from_secs(2));
        assert_eq!(options.backoff_after(2), Duration::from_secs(4));
        assert_eq!(options.backoff_after(3), Duration::from_secs(8));

        let reversal = JobOptions::reversal();
        assert_eq!(reversal.delay(), Duration::from_secs(5));
        assert_eq!(reversal.backoff_after(4), Duration::from_secs(24));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let options = JobOptions {
            backoff: Backoff::Fixed,
            ..JobOptions::bill_payment()
        };
        assert_eq!(options.backoff_after(1), options.backoff_after(5));
    }

    #[test]
    fn options_deserialize_from_config_shape() {
        let options: JobOptions = serde_json::from_value(serde_json::json!({
            "attempts": 4,
            "backoff": "fixed",
            "backoff_ms": 10,
        }))
        .unwrap();
        assert_eq!(options.attempts, 4);
        assert_eq!(options.backoff, Backoff::Fixed);
        assert_eq!(options.delay_ms, 0);
    }

    #[test]
    fn job_serializes_with_type_tag() {
        let job = Job::ProcessBillPayment {
            transaction_id: Uuid::nil(),
            request: PaymentRequest {
                bill_type: "water".to_string(),
                amount: MoneyCents::new(100),
                customer_reference: "C1".to_string(),
                reference: "BILL_1".to_string(),
                metadata: None,
            },
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "process_bill_payment");
        assert_eq!(value["request"]["amount"], 100);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let (queue, receiver) = JobQueue::new();
        let handler = Flaky::new(2, || EngineError::ExternalService("timeout".to_string()));
        let pool = WorkerPool::spawn(queue.clone(), receiver, handler.clone(), 2);

        queue.enqueue(reversal_job(), fast(3)).unwrap();
        settle(&handler).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
        assert!(queue.dead_letters().is_empty());
        pool.shutdown();
    }

    #[tokio::test]
    async fn exhausted_job_runs_hook_and_is_dead_lettered() {
        let (queue, receiver) = JobQueue::new();
        let handler = Flaky::new(10, || EngineError::ExternalService("timeout".to_string()));
        let pool = WorkerPool::spawn(queue.clone(), receiver, handler.clone(), 1);

        let job = reversal_job();
        queue.enqueue(job.clone(), fast(2)).unwrap();
        settle(&handler).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job, job);
        assert_eq!(dead[0].attempts, 2);
        pool.shutdown();
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let (queue, receiver) = JobQueue::new();
        let handler = Flaky::new(10, || {
            EngineError::KeyNotFound("transaction not exists".to_string())
        });
        let pool = WorkerPool::spawn(queue.clone(), receiver, handler.clone(), 1);

        queue.enqueue(reversal_job(), fast(5)).unwrap();
        settle(&handler).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dead_letters()[0].attempts, 1);
        pool.shutdown();
    }

    #[test]
    fn dead_letter_list_is_bounded() {
        let (queue, _receiver) = JobQueue::with_dead_letter_capacity(2);
        let error = EngineError::ExternalService("down".to_string());
        let jobs: Vec<Job> = (0..3).map(|_| reversal_job()).collect();
        for job in &jobs {
            queue.bury(job.clone(), &error, 5);
        }

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].job, jobs[1]);
        assert_eq!(dead[1].job, jobs[2]);
    }
}
