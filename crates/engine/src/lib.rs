//! Wallet ledger and bill payment saga.
//!
//! Balances live in [`WalletLedger`] behind optimistic compare-and-swap
//! updates, every movement is audited by [`TransactionLedger`], and
//! [`BillPaymentSaga`] drives a payment through reserve, settle, compensate
//! and reverse on top of both.

pub use error::EngineError;
pub use events::{Event, EventBus};
pub use gateway::{
    GatewayFuture, PaymentGateway, PaymentRequest, PaymentResponse, SimulatedGateway,
    SimulatedGatewayConfig,
};
pub use ledger::{TransactionLedger, WalletLedger};
pub use money::MoneyCents;
pub use queue::{
    Backoff, DeadLetter, Job, JobFuture, JobHandler, JobOptions, JobQueue, JobReceiver,
    WorkerPool,
};
pub use saga::{
    BillPayment, BillPaymentAccepted, BillPaymentSaga, ReversalOutcome, SagaBuilder, SagaConfig,
};
pub use transactions::{Transaction, TransactionKind, TransactionStatus};
pub use wallets::Wallet;

mod error;
mod events;
mod gateway;
mod ledger;
mod money;
mod queue;
mod saga;
mod transactions;
mod util;
mod wallets;

type ResultEngine<T> = Result<T, EngineError>;
