use chrono::Utc;
use uuid::Uuid;

use sea_orm::{ActiveModelTrait, ConnectionTrait, QueryFilter, prelude::*, sea_query::Expr};

use crate::{EngineError, MoneyCents, ResultEngine, Wallet, wallets};

/// Owns every change to a wallet's `balance` and `version`.
///
/// Mutations are compare-and-swap updates guarded by the version observed
/// at read time; no lock is held between the read and the write. A writer
/// that loses the race gets [`EngineError::Conflict`] and must re-read. The
/// ledger never retries on its own.
///
/// Every method takes the connection to run on, so the same call works
/// against the pool or inside an open database transaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalletLedger;

impl WalletLedger {
    pub fn new() -> Self {
        Self
    }

    /// Return a wallet snapshot from DB.
    pub async fn wallet<C: ConnectionTrait>(&self, db: &C, wallet_id: Uuid) -> ResultEngine<Wallet> {
        wallets::Entity::find_by_id(wallet_id.to_string())
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("wallet not exists".to_string()))
            .and_then(Wallet::try_from)
    }

    /// Return the wallet owned by `user_id`.
    pub async fn wallet_by_user<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: &str,
    ) -> ResultEngine<Wallet> {
        find_by_user(db, user_id)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("wallet not exists".to_string()))
    }

    /// Create the wallet for `user_id` with a zero balance at version 0.
    ///
    /// Fails with [`EngineError::Conflict`] if the user already has one.
    pub async fn provision<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: &str,
    ) -> ResultEngine<Wallet> {
        let wallet = Wallet::new(user_id.to_string());
        wallets::ActiveModel::from(&wallet)
            .insert(db)
            .await
            .map_err(|err| EngineError::from_insert(err, "wallet for this user"))?;

        tracing::info!(wallet_id = %wallet.id, user_id, "wallet created");
        Ok(wallet)
    }

    /// Credit `amount` to the user's wallet, creating the wallet first if the
    /// user has none.
    pub async fn fund<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: &str,
        amount: MoneyCents,
    ) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;

        let observed = match find_by_user(db, user_id).await? {
            Some(wallet) => wallet,
            None => match self.provision(db, user_id).await {
                Ok(wallet) => wallet,
                // Someone else provisioned it between our read and insert.
                Err(EngineError::Conflict(_)) => self.wallet_by_user(db, user_id).await?,
                Err(err) => return Err(err),
            },
        };

        let wallet = self.credit_observed(db, &observed, amount, "funding").await?;
        tracing::info!(
            wallet_id = %wallet.id,
            user_id,
            %amount,
            balance = %wallet.balance,
            "wallet funded"
        );
        Ok(wallet)
    }

    /// Debit `amount` from the wallet.
    ///
    /// Reads the wallet, rejects the debit if the balance is too low, then
    /// applies it with a compare-and-swap on the observed version.
    pub async fn debit<C: ConnectionTrait>(
        &self,
        db: &C,
        wallet_id: Uuid,
        amount: MoneyCents,
        reference: &str,
    ) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;
        let observed = self.wallet(db, wallet_id).await?;
        if observed.balance < amount {
            tracing::warn!(
                %wallet_id,
                %amount,
                balance = %observed.balance,
                reference,
                "debit rejected: insufficient funds"
            );
            return Err(EngineError::InsufficientFunds(format!(
                "balance {} is lower than {}",
                observed.balance, amount
            )));
        }
        self.debit_observed(db, &observed, amount, reference).await
    }

    /// The compare-and-swap half of [`debit`](Self::debit), against a wallet
    /// the caller has already read.
    ///
    /// Guarded by `id`, the observed `version` and `balance >= amount`. When
    /// nothing matches the caller cannot tell a concurrent modification from
    /// a just-missed balance check; both surface as
    /// [`EngineError::Conflict`].
    pub async fn debit_observed<C: ConnectionTrait>(
        &self,
        db: &C,
        observed: &Wallet,
        amount: MoneyCents,
        reference: &str,
    ) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;
        let affected = compare_and_swap(db, observed, -amount, Some(amount)).await?;
        if affected == 0 {
            tracing::warn!(
                wallet_id = %observed.id,
                version = observed.version,
                %amount,
                reference,
                "debit lost optimistic lock"
            );
            return Err(EngineError::Conflict(
                "insufficient funds or wallet was modified".to_string(),
            ));
        }

        let wallet = self.wallet(db, observed.id).await?;
        tracing::info!(
            wallet_id = %wallet.id,
            %amount,
            reference,
            balance = %wallet.balance,
            version = wallet.version,
            "wallet debited"
        );
        Ok(wallet)
    }

    /// Credit `amount` to the wallet with a compare-and-swap on the observed
    /// version. Credits cannot take the balance below zero, so there is no
    /// balance guard.
    pub async fn credit<C: ConnectionTrait>(
        &self,
        db: &C,
        wallet_id: Uuid,
        amount: MoneyCents,
        reference: &str,
    ) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;
        let observed = self.wallet(db, wallet_id).await?;
        self.credit_observed(db, &observed, amount, reference).await
    }

    /// The compare-and-swap half of [`credit`](Self::credit).
    pub async fn credit_observed<C: ConnectionTrait>(
        &self,
        db: &C,
        observed: &Wallet,
        amount: MoneyCents,
        reference: &str,
    ) -> ResultEngine<Wallet> {
        let amount = amount.require_positive("amount")?;
        if observed.balance.checked_add(amount).is_none() {
            tracing::warn!(
                wallet_id = %observed.id,
                %amount,
                balance = %observed.balance,
                reference,
                "credit rejected: balance would overflow"
            );
            return Err(EngineError::Validation(format!(
                "crediting {amount} would overflow the wallet balance"
            )));
        }
        let affected = compare_and_swap(db, observed, amount, None).await?;
        if affected == 0 {
            tracing::warn!(
                wallet_id = %observed.id,
                version = observed.version,
                %amount,
                reference,
                "credit lost optimistic lock"
            );
            return Err(EngineError::Conflict(
                "wallet was modified by another transaction".to_string(),
            ));
        }

        let wallet = self.wallet(db, observed.id).await?;
        tracing::info!(
            wallet_id = %wallet.id,
            %amount,
            reference,
            balance = %wallet.balance,
            version = wallet.version,
            "wallet credited"
        );
        Ok(wallet)
    }
}

async fn find_by_user<C: ConnectionTrait>(db: &C, user_id: &str) -> ResultEngine<Option<Wallet>> {
    wallets::Entity::find()
        .filter(wallets::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .map(Wallet::try_from)
        .transpose()
}

/// `UPDATE wallets SET balance = balance + delta, version = version + 1
///  WHERE id = :id AND version = :observed [AND balance >= :floor]`
///
/// Returns the number of rows the update touched (0 or 1).
async fn compare_and_swap<C: ConnectionTrait>(
    db: &C,
    observed: &Wallet,
    delta: MoneyCents,
    floor: Option<MoneyCents>,
) -> ResultEngine<u64> {
    let mut update = wallets::Entity::update_many()
        .col_expr(
            wallets::Column::Balance,
            Expr::col(wallets::Column::Balance).add(delta.cents()),
        )
        .col_expr(
            wallets::Column::Version,
            Expr::col(wallets::Column::Version).add(1),
        )
        .col_expr(wallets::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(wallets::Column::Id.eq(observed.id.to_string()))
        .filter(wallets::Column::Version.eq(observed.version));
    if let Some(floor) = floor {
        update = update.filter(wallets::Column::Balance.gte(floor.cents()));
    }

    Ok(update.exec(db).await?.rows_affected)
}
