//! The external bill payment provider.
//!
//! Only the logical contract matters to the saga: a request goes out, a
//! response says whether the provider settled it. An `Err` means the call
//! itself did not complete (timeout, transport failure) and is worth
//! retrying; `success == false` is the provider's final answer.

use std::{future::Future, pin::Pin, time::Duration};

use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

use crate::{MoneyCents, ResultEngine};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub bill_type: String,
    pub amount: MoneyCents,
    pub customer_reference: String,
    /// Our transaction reference, so the provider can drop duplicates.
    pub reference: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub success: bool,
    /// Provider-side id; empty when `success` is false.
    pub transaction_id: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

pub type GatewayFuture<'a> = Pin<Box<dyn Future<Output = ResultEngine<PaymentResponse>> + Send + 'a>>;

pub trait PaymentGateway: Send + Sync {
    fn process_payment<'a>(&'a self, request: &'a PaymentRequest) -> GatewayFuture<'a>;
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimulatedGatewayConfig {
    /// Probability in `[0, 1]` that a call settles.
    pub success_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for SimulatedGatewayConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.2,
            min_latency_ms: 1_000,
            max_latency_ms: 3_000,
        }
    }
}

/// Stand-in provider: slow and unreliable.
#[derive(Clone, Debug, Default)]
pub struct SimulatedGateway {
    config: SimulatedGatewayConfig,
}

impl SimulatedGateway {
    pub fn new(config: SimulatedGatewayConfig) -> Self {
        Self { config }
    }

    fn roll(&self) -> (Duration, bool, String, String) {
        let mut rng = rand::thread_rng();
        let low = self.config.min_latency_ms.min(self.config.max_latency_ms);
        let high = self.config.min_latency_ms.max(self.config.max_latency_ms);
        let latency = Duration::from_millis(rng.gen_range(low..=high));
        let success = rng.gen_bool(self.config.success_rate.clamp(0.0, 1.0));
        let suffix: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(char::from)
            .collect();
        let token: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        (latency, success, suffix.to_lowercase(), token.to_uppercase())
    }
}

impl PaymentGateway for SimulatedGateway {
    fn process_payment<'a>(&'a self, request: &'a PaymentRequest) -> GatewayFuture<'a> {
        Box::pin(async move {
            // ThreadRng is not Send, draw everything before the first await.
            let (latency, success, suffix, token) = self.roll();
            tokio::time::sleep(latency).await;

            if !success {
                tracing::debug!(reference = %request.reference, "simulated provider declined");
                return Ok(PaymentResponse {
                    success: false,
                    transaction_id: String::new(),
                    message: "External service temporarily unavailable".to_string(),
                    data: None,
                });
            }

            let millis = chrono::Utc::now().timestamp_millis();
            Ok(PaymentResponse {
                success: true,
                transaction_id: format!("EXT_{millis}_{suffix}"),
                message: "Bill payment processed successfully".to_string(),
                data: Some(serde_json::json!({
                    "billType": request.bill_type,
                    "amount": request.amount,
                    "customerReference": request.customer_reference,
                    "token": token,
                })),
            })
        })
    }
}
