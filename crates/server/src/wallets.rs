//! Wallet API endpoints

use api_types::wallet::{WalletFund, WalletView};
use axum::{Extension, Json, extract::State};
use engine::{MoneyCents, Wallet};

use crate::{
    ServerError,
    server::{Caller, ServerState},
};

fn wallet_view(wallet: Wallet) -> WalletView {
    WalletView {
        id: wallet.id,
        user_id: wallet.user_id,
        balance_minor: wallet.balance.cents(),
        version: wallet.version,
        created_at: wallet.created_at,
        updated_at: wallet.updated_at,
    }
}

/// Handle requests for the caller's `Wallet`
pub async fn get(
    Extension(Caller(user_id)): Extension<Caller>,
    State(state): State<ServerState>,
) -> Result<Json<WalletView>, ServerError> {
    let wallet = state.saga.wallet_for_user(&user_id).await?;
    Ok(Json(wallet_view(wallet)))
}

/// Handle requests for funding the caller's `Wallet`, creating it on first use
pub async fn fund(
    Extension(Caller(user_id)): Extension<Caller>,
    State(state): State<ServerState>,
    Json(payload): Json<WalletFund>,
) -> Result<Json<WalletView>, ServerError> {
    let wallet = state
        .saga
        .fund_wallet(&user_id, MoneyCents::new(payload.amount_minor))
        .await?;
    Ok(Json(wallet_view(wallet)))
}
