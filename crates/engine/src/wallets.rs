//! The module contains `Wallet` struct and its persistence model.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, MoneyCents, util::parse_uuid};

/// A user's wallet.
///
/// Exactly one wallet exists per user. The balance is only ever changed
/// through [`WalletLedger`](crate::WalletLedger), which bumps `version` on
/// every successful mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Stable identifier for this wallet.
    pub id: Uuid,
    pub user_id: String,
    pub balance: MoneyCents,
    /// Optimistic-lock counter, incremented by exactly one per mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// A fresh, empty wallet for `user_id`.
    pub fn new(user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            balance: MoneyCents::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "wallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub user_id: String,
    pub balance: i64,
    pub version: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::transactions::Entity")]
    Transactions,
}

impl Related<super::transactions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Wallet> for ActiveModel {
    fn from(value: &Wallet) -> Self {
        Self {
            id: ActiveValue::Set(value.id.to_string()),
            user_id: ActiveValue::Set(value.user_id.clone()),
            balance: ActiveValue::Set(value.balance.cents()),
            version: ActiveValue::Set(value.version),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        }
    }
}

impl TryFrom<Model> for Wallet {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "wallet")?,
            user_id: model.user_id,
            balance: MoneyCents::new(model.balance),
            version: model.version,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_wallet_starts_empty_at_version_zero() {
        let wallet = Wallet::new("alice".to_string());
        assert_eq!(wallet.balance, MoneyCents::ZERO);
        assert_eq!(wallet.version, 0);
        assert_eq!(wallet.user_id, "alice");
    }

    #[test]
    fn model_round_trip_keeps_identity() {
        let wallet = Wallet::new("bob".to_string());
        let model = Model {
            id: wallet.id.to_string(),
            user_id: wallet.user_id.clone(),
            balance: 1234,
            version: 7,
            created_at: wallet.created_at,
            updated_at: wallet.updated_at,
        };
        let back = Wallet::try_from(model).unwrap();
        assert_eq!(back.id, wallet.id);
        assert_eq!(back.balance, MoneyCents::new(1234));
        assert_eq!(back.version, 7);
    }

    #[test]
    fn model_with_bad_id_is_rejected() {
        let now = Utc::now();
        let model = Model {
            id: "not-a-uuid".to_string(),
            user_id: "carol".to_string(),
            balance: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            Wallet::try_from(model),
            Err(EngineError::Validation(_))
        ));
    }
}
