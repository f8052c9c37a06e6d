//! Transaction primitives.
//!
//! A `Transaction` records one balance-affecting intent and the lifecycle of
//! that intent. Rows are append-only: after creation only `status`,
//! `external_reference`, `failure_reason` and the reversal link change.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, MoneyCents, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Funding,
    BillPayment,
    Reversal,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Funding => "funding",
            Self::BillPayment => "bill_payment",
            Self::Reversal => "reversal",
        }
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "funding" => Ok(Self::Funding),
            "bill_payment" => Ok(Self::BillPayment),
            "reversal" => Ok(Self::Reversal),
            other => Err(EngineError::Validation(format!(
                "invalid transaction kind: {other}"
            ))),
        }
    }
}

/// Lifecycle of a transaction.
///
/// ```text
/// PENDING ──► PROCESSING ──► COMPLETED
///    │            │
///    │            └────────► FAILED ──► REVERSED
///    ├──────────────────────► FAILED
///    └──────────────────────► COMPLETED   (internal entries)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Reversed => "reversed",
        }
    }

    /// `COMPLETED` and `REVERSED` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Reversed)
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Reversed)
        )
    }
}

impl TryFrom<&str> for TransactionStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "reversed" => Ok(Self::Reversed),
            other => Err(EngineError::Validation(format!(
                "invalid transaction status: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    /// Signed: positive credits the wallet, negative debits it.
    pub amount: MoneyCents,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Globally unique; the idempotency key for the external step.
    pub reference: String,
    pub external_reference: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub reversal_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A new `PENDING` transaction.
    pub fn new(
        wallet_id: Uuid,
        amount: MoneyCents,
        kind: TransactionKind,
        reference: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            amount,
            kind,
            status: TransactionStatus::Pending,
            reference,
            external_reference: None,
            metadata,
            failure_reason: None,
            reversal_transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub wallet_id: String,
    pub amount: i64,
    pub kind: String,
    pub status: String,
    #[sea_orm(unique)]
    pub reference: String,
    pub external_reference: Option<String>,
    pub metadata: Option<Json>,
    pub failure_reason: Option<String>,
    pub reversal_transaction_id: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::wallets::Entity",
        from = "Column::WalletId",
        to = "super::wallets::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Wallets,
}

impl Related<super::wallets::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Wallets.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Transaction> for ActiveModel {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: ActiveValue::Set(tx.id.to_string()),
            wallet_id: ActiveValue::Set(tx.wallet_id.to_string()),
            amount: ActiveValue::Set(tx.amount.cents()),
            kind: ActiveValue::Set(tx.kind.as_str().to_string()),
            status: ActiveValue::Set(tx.status.as_str().to_string()),
            reference: ActiveValue::Set(tx.reference.clone()),
            external_reference: ActiveValue::Set(tx.external_reference.clone()),
            metadata: ActiveValue::Set(tx.metadata.clone()),
            failure_reason: ActiveValue::Set(tx.failure_reason.clone()),
            reversal_transaction_id: ActiveValue::Set(
                tx.reversal_transaction_id.map(|id| id.to_string()),
            ),
            is_deleted: ActiveValue::Set(false),
            created_at: ActiveValue::Set(tx.created_at),
            updated_at: ActiveValue::Set(tx.updated_at),
        }
    }
}

impl TryFrom<Model> for Transaction {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "transaction")?,
            wallet_id: parse_uuid(&model.wallet_id, "wallet")?,
            amount: MoneyCents::new(model.amount),
            kind: TransactionKind::try_from(model.kind.as_str())?,
            status: TransactionStatus::try_from(model.status.as_str())?,
            reference: model.reference,
            external_reference: model.external_reference,
            metadata: model.metadata,
            failure_reason: model.failure_reason,
            reversal_transaction_id: model
                .reversal_transaction_id
                .as_deref()
                .map(|id| parse_uuid(id, "transaction"))
                .transpose()?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    const ALL: [TransactionStatus; 5] = [Pending, Processing, Completed, Failed, Reversed];

    #[test]
    fn terminal_states_reject_every_transition() {
        for from in [Completed, Reversed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn saga_path_is_allowed() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Reversed));
    }

    #[test]
    fn self_transitions_and_shortcuts_are_rejected() {
        for status in ALL {
            assert!(!status.can_transition_to(status));
        }
        assert!(!Pending.can_transition_to(Reversed));
        assert!(!Processing.can_transition_to(Reversed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(TransactionStatus::try_from("settled").is_err());
        assert_eq!(
            TransactionStatus::try_from("reversed").unwrap(),
            TransactionStatus::Reversed
        );
    }

    #[test]
    fn new_transaction_is_pending() {
        let tx = Transaction::new(
            Uuid::new_v4(),
            MoneyCents::new(-5000),
            TransactionKind::BillPayment,
            "BILL_1".to_string(),
            None,
        );
        assert_eq!(tx.status, Pending);
        assert!(tx.amount.is_negative());
        assert!(tx.reversal_transaction_id.is_none());
    }
}
