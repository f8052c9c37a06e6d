//! Bill payment API endpoints

use api_types::bill::{BillPay, BillPayAccepted, BillStatus};
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use engine::{BillPayment, MoneyCents};
use uuid::Uuid;

use crate::{
    ServerError,
    server::{Caller, ServerState},
    transactions::{map_kind, map_status},
};

/// Reserve funds and queue the payment. The outcome is polled through
/// [`status`].
pub async fn pay(
    Extension(Caller(user_id)): Extension<Caller>,
    State(state): State<ServerState>,
    Json(payload): Json<BillPay>,
) -> Result<(StatusCode, Json<BillPayAccepted>), ServerError> {
    let accepted = state
        .saga
        .pay_bill(
            &user_id,
            BillPayment {
                bill_type: payload.bill_type,
                amount: MoneyCents::new(payload.amount_minor),
                customer_reference: payload.customer_reference,
                metadata: payload.metadata,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BillPayAccepted {
            transaction_id: accepted.transaction_id,
            reference: accepted.reference,
            status: map_status(accepted.status),
        }),
    ))
}

pub async fn status(
    Extension(Caller(user_id)): Extension<Caller>,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<BillStatus>, ServerError> {
    let Ok(transaction_id) = Uuid::parse_str(&id) else {
        return Err(ServerError::Generic("invalid transaction id".to_string()));
    };
    let tx = state
        .saga
        .transaction_for_user(&user_id, transaction_id)
        .await?;

    Ok(Json(BillStatus {
        transaction_id: tx.id,
        reference: tx.reference,
        kind: map_kind(tx.kind),
        status: map_status(tx.status),
        amount_minor: tx.amount.abs().cents(),
        external_reference: tx.external_reference,
        failure_reason: tx.failure_reason,
        metadata: tx.metadata,
        created_at: tx.created_at,
        updated_at: tx.updated_at,
    }))
}
