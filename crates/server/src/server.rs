use axum::{
    Router,
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Error as AxumError, Header},
};

use std::{net::SocketAddr, sync::Arc};

use crate::{bills, transactions, wallets};
use engine::BillPaymentSaga;

static USER_ID_HEADER: axum::http::HeaderName = axum::http::HeaderName::from_static("user-id");

#[derive(Clone)]
pub struct ServerState {
    pub saga: Arc<BillPaymentSaga>,
}

/// The caller, as stated by the `user-id` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller(pub String);

/// `TypedHeader` for the caller id header
///
/// Every request must contain a non-blank "user-id" entry in the header.
#[derive(Debug)]
struct UserIdHeader(String);

impl Header for UserIdHeader {
    fn name() -> &'static axum::http::HeaderName {
        &USER_ID_HEADER
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, AxumError>
    where
        Self: Sized,
        I: Iterator<Item = &'i axum::http::HeaderValue>,
    {
        let value = values.next().ok_or_else(AxumError::invalid)?;
        let Ok(value) = value.to_str() else {
            return Err(AxumError::invalid());
        };
        let value = value.trim();
        if value.is_empty() {
            return Err(AxumError::invalid());
        }

        Ok(UserIdHeader(value.to_string()))
    }

    fn encode<E: Extend<axum::http::HeaderValue>>(&self, values: &mut E) {
        match axum::http::HeaderValue::from_str(&self.0) {
            Ok(value) => values.extend(std::iter::once(value)),
            Err(_) => tracing::error!("failed to encode user-id header"),
        }
    }
}

async fn identify(
    user_id: Option<TypedHeader<UserIdHeader>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(TypedHeader(UserIdHeader(user_id))) = user_id else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    request.extensions_mut().insert(Caller(user_id));
    Ok(next.run(request).await)
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/wallet", get(wallets::get))
        .route("/wallet/fund", post(wallets::fund))
        .route("/transactions", get(transactions::list))
        .route("/bills/pay", post(bills::pay))
        .route("/bills/transactions/{id}/status", get(bills::status))
        .route_layer(middleware::from_fn(identify))
        .with_state(state)
}

pub async fn run(saga: Arc<BillPaymentSaga>, addr: SocketAddr) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind server listener: {err}");
            return;
        }
    };
    if let Err(err) = run_with_listener(saga, listener).await {
        tracing::error!("server failed: {err}");
    }
}

pub async fn run_with_listener(
    saga: Arc<BillPaymentSaga>,
    listener: tokio::net::TcpListener,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router(ServerState { saga })).await
}

pub fn spawn_with_listener(
    saga: Arc<BillPaymentSaga>,
    listener: tokio::net::TcpListener,
) -> Result<SocketAddr, std::io::Error> {
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(err) = run_with_listener(saga, listener).await {
            tracing::error!("server failed: {err}");
        }
    });

    Ok(addr)
}
