//! Transactions API endpoints

use api_types::{
    TransactionStatus as ApiStatus,
    transaction::{TransactionKind as ApiKind, TransactionListResponse, TransactionView},
};
use axum::{Extension, Json, extract::State};

use crate::{
    ServerError,
    server::{Caller, ServerState},
};

pub(crate) fn map_kind(kind: engine::TransactionKind) -> ApiKind {
    match kind {
        engine::TransactionKind::Funding => ApiKind::Funding,
        engine::TransactionKind::BillPayment => ApiKind::BillPayment,
        engine::TransactionKind::Reversal => ApiKind::Reversal,
    }
}

pub(crate) fn map_status(status: engine::TransactionStatus) -> ApiStatus {
    match status {
        engine::TransactionStatus::Pending => ApiStatus::Pending,
        engine::TransactionStatus::Processing => ApiStatus::Processing,
        engine::TransactionStatus::Completed => ApiStatus::Completed,
        engine::TransactionStatus::Failed => ApiStatus::Failed,
        engine::TransactionStatus::Reversed => ApiStatus::Reversed,
    }
}

fn transaction_view(tx: engine::Transaction) -> TransactionView {
    TransactionView {
        id: tx.id,
        kind: map_kind(tx.kind),
        status: map_status(tx.status),
        amount_minor: tx.amount.cents(),
        reference: tx.reference,
        external_reference: tx.external_reference,
        failure_reason: tx.failure_reason,
        reversal_transaction_id: tx.reversal_transaction_id,
        metadata: tx.metadata,
        created_at: tx.created_at,
        updated_at: tx.updated_at,
    }
}

/// The caller's transactions, newest first.
pub async fn list(
    Extension(Caller(user_id)): Extension<Caller>,
    State(state): State<ServerState>,
) -> Result<Json<TransactionListResponse>, ServerError> {
    let transactions = state
        .saga
        .transactions_for_user(&user_id)
        .await?
        .into_iter()
        .map(transaction_view)
        .collect();

    Ok(Json(TransactionListResponse { transactions }))
}
