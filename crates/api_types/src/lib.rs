use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

pub mod wallet {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct WalletFund {
        /// Amount to credit, in minor units. Must be positive.
        pub amount_minor: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct WalletView {
        pub id: Uuid,
        pub user_id: String,
        pub balance_minor: i64,
        pub version: i64,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }
}

pub mod transaction {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TransactionKind {
        Funding,
        BillPayment,
        Reversal,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct TransactionView {
        pub id: Uuid,
        pub kind: TransactionKind,
        pub status: TransactionStatus,
        /// Signed: positive credits the wallet, negative debits it.
        pub amount_minor: i64,
        pub reference: String,
        pub external_reference: Option<String>,
        pub failure_reason: Option<String>,
        pub reversal_transaction_id: Option<Uuid>,
        pub metadata: Option<serde_json::Value>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct TransactionListResponse {
        pub transactions: Vec<TransactionView>,
    }
}

pub mod bill {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct BillPay {
        pub bill_type: String,
        pub amount_minor: i64,
        pub customer_reference: String,
        #[serde(default)]
        pub metadata: Option<serde_json::Value>,
    }

    /// Reply to an accepted payment. Settlement happens later; poll the
    /// status endpoint for the outcome.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct BillPayAccepted {
        pub transaction_id: Uuid,
        pub reference: String,
        pub status: TransactionStatus,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct BillStatus {
        pub transaction_id: Uuid,
        pub reference: String,
        pub kind: crate::transaction::TransactionKind,
        pub status: TransactionStatus,
        /// Amount paid, always positive.
        pub amount_minor: i64,
        pub external_reference: Option<String>,
        pub failure_reason: Option<String>,
        pub metadata: Option<serde_json::Value>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bill_pay_metadata_is_optional() {
        let body: bill::BillPay = serde_json::from_str(
            r#"{"bill_type":"airtime","amount_minor":1500,"customer_reference":"0801"}"#,
        )
        .unwrap();
        assert!(body.metadata.is_none());
        assert_eq!(body.amount_minor, 1500);
    }

    #[test]
    fn status_serializes_lowercase() {
        let value = serde_json::to_value(TransactionStatus::Processing).unwrap();
        assert_eq!(value, "processing");
    }
}
