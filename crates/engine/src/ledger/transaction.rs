use chrono::{DateTime, Utc};
use uuid::Uuid;

use sea_orm::{
    ActiveModelTrait, ConnectionTrait, QueryFilter, QueryOrder, prelude::*, sea_query::Expr,
};

use crate::{
    EngineError, MoneyCents, ResultEngine, Transaction, TransactionKind, TransactionStatus,
    events::{Event, EventBus},
    transactions,
    util::normalize_required,
    wallets,
};

/// Append-only record of balance-affecting intents and their status.
///
/// Rows are never physically removed. The unique `reference` column is the
/// idempotency anchor: recording a reference twice fails with
/// [`EngineError::Conflict`].
#[derive(Clone, Debug)]
pub struct TransactionLedger {
    events: EventBus,
}

impl TransactionLedger {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Append a `PENDING` transaction.
    pub async fn record<C: ConnectionTrait>(
        &self,
        db: &C,
        wallet_id: Uuid,
        amount: MoneyCents,
        kind: TransactionKind,
        reference: &str,
        metadata: Option<serde_json::Value>,
    ) -> ResultEngine<Transaction> {
        if amount.is_zero() {
            return Err(EngineError::Validation(
                "transaction amount must not be zero".to_string(),
            ));
        }
        let reference = normalize_required(reference, "reference")?;

        let tx = Transaction::new(wallet_id, amount, kind, reference, metadata);
        transactions::ActiveModel::from(&tx)
            .insert(db)
            .await
            .map_err(|err| {
                tracing::warn!(reference = %tx.reference, error = %err, "failed to record transaction");
                EngineError::from_insert(err, "transaction reference")
            })?;

        tracing::info!(
            transaction_id = %tx.id,
            %wallet_id,
            reference = %tx.reference,
            %amount,
            kind = kind.as_str(),
            "transaction recorded"
        );
        Ok(tx)
    }

    /// Move a transaction to `next`, optionally setting the provider's
    /// reference and a failure reason. `None` leaves a field untouched.
    ///
    /// The write is conditional on the status read just before it, so two
    /// writers racing on the same row cannot both win: the loser gets
    /// [`EngineError::Conflict`]. Advancing to `FAILED` publishes
    /// [`Event::TransactionFailed`].
    pub async fn advance<C: ConnectionTrait>(
        &self,
        db: &C,
        transaction_id: Uuid,
        next: TransactionStatus,
        external_reference: Option<&str>,
        failure_reason: Option<&str>,
    ) -> ResultEngine<Transaction> {
        let current = find_model(db, transaction_id)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("transaction not exists".to_string()))
            .and_then(Transaction::try_from)?;

        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition(format!(
                "{} -> {}",
                current.status.as_str(),
                next.as_str()
            )));
        }

        let mut update = transactions::Entity::update_many()
            .col_expr(transactions::Column::Status, Expr::value(next.as_str()))
            .col_expr(transactions::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(transactions::Column::Id.eq(transaction_id.to_string()))
            .filter(transactions::Column::Status.eq(current.status.as_str()));
        if let Some(external_reference) = external_reference {
            update = update.col_expr(
                transactions::Column::ExternalReference,
                Expr::value(external_reference),
            );
        }
        if let Some(failure_reason) = failure_reason {
            update = update.col_expr(
                transactions::Column::FailureReason,
                Expr::value(failure_reason),
            );
        }

        if update.exec(db).await?.rows_affected == 0 {
            return Err(EngineError::Conflict(format!(
                "transaction {transaction_id} changed status concurrently"
            )));
        }

        let updated = self.get_any(db, transaction_id).await?;
        tracing::info!(
            %transaction_id,
            from = current.status.as_str(),
            to = next.as_str(),
            external_reference = updated.external_reference.as_deref(),
            "transaction status updated"
        );

        if next == TransactionStatus::Failed {
            self.events.publish(Event::TransactionFailed {
                transaction_id,
                reason: updated.failure_reason.clone(),
            });
        }

        Ok(updated)
    }

    /// Point read by id, hiding soft-deleted rows.
    pub async fn get<C: ConnectionTrait>(
        &self,
        db: &C,
        transaction_id: Uuid,
    ) -> ResultEngine<Transaction> {
        transactions::Entity::find_by_id(transaction_id.to_string())
            .filter(transactions::Column::IsDeleted.eq(false))
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("transaction not exists".to_string()))
            .and_then(Transaction::try_from)
    }

    /// Point read by the unique reference, hiding soft-deleted rows.
    pub async fn by_reference<C: ConnectionTrait>(
        &self,
        db: &C,
        reference: &str,
    ) -> ResultEngine<Transaction> {
        transactions::Entity::find()
            .filter(transactions::Column::Reference.eq(reference))
            .filter(transactions::Column::IsDeleted.eq(false))
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound(reference.to_string()))
            .and_then(Transaction::try_from)
    }

    /// Point the original transaction at the entry that reversed it.
    pub async fn link_reversal<C: ConnectionTrait>(
        &self,
        db: &C,
        original_id: Uuid,
        reversal_id: Uuid,
    ) -> ResultEngine<()> {
        let result = transactions::Entity::update_many()
            .col_expr(
                transactions::Column::ReversalTransactionId,
                Expr::value(reversal_id.to_string()),
            )
            .col_expr(transactions::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(transactions::Column::Id.eq(original_id.to_string()))
            .exec(db)
            .await?;
        if result.rows_affected == 0 {
            return Err(EngineError::KeyNotFound("transaction not exists".to_string()));
        }
        Ok(())
    }

    /// Hide a transaction from listings. The row itself is kept.
    pub async fn soft_delete<C: ConnectionTrait>(
        &self,
        db: &C,
        transaction_id: Uuid,
    ) -> ResultEngine<()> {
        let result = transactions::Entity::update_many()
            .col_expr(transactions::Column::IsDeleted, Expr::value(true))
            .col_expr(transactions::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(transactions::Column::Id.eq(transaction_id.to_string()))
            .exec(db)
            .await?;
        if result.rows_affected == 0 {
            return Err(EngineError::KeyNotFound("transaction not exists".to_string()));
        }
        tracing::info!(%transaction_id, "transaction soft-deleted");
        Ok(())
    }

    /// Transactions of a wallet, newest first.
    pub async fn list_by_wallet<C: ConnectionTrait>(
        &self,
        db: &C,
        wallet_id: Uuid,
    ) -> ResultEngine<Vec<Transaction>> {
        transactions::Entity::find()
            .filter(transactions::Column::WalletId.eq(wallet_id.to_string()))
            .filter(transactions::Column::IsDeleted.eq(false))
            .order_by_desc(transactions::Column::CreatedAt)
            .all(db)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    /// Transactions of the wallet owned by `user_id`, newest first.
    ///
    /// Fails with [`EngineError::KeyNotFound`] if the user has no wallet.
    pub async fn list_by_user<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: &str,
    ) -> ResultEngine<Vec<Transaction>> {
        let wallet = wallets::Entity::find()
            .filter(wallets::Column::UserId.eq(user_id))
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("wallet not exists".to_string()))?;

        transactions::Entity::find()
            .filter(transactions::Column::WalletId.eq(wallet.id))
            .filter(transactions::Column::IsDeleted.eq(false))
            .order_by_desc(transactions::Column::CreatedAt)
            .all(db)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    /// Bill payments stuck in `FAILED` with no reversal, last touched before
    /// `older_than`. Oldest first.
    pub async fn failed_unreversed<C: ConnectionTrait>(
        &self,
        db: &C,
        older_than: DateTime<Utc>,
    ) -> ResultEngine<Vec<Transaction>> {
        transactions::Entity::find()
            .filter(transactions::Column::Kind.eq(TransactionKind::BillPayment.as_str()))
            .filter(transactions::Column::Status.eq(TransactionStatus::Failed.as_str()))
            .filter(transactions::Column::ReversalTransactionId.is_null())
            .filter(transactions::Column::UpdatedAt.lt(older_than))
            .order_by_asc(transactions::Column::UpdatedAt)
            .all(db)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    /// Like [`get`](Self::get) but also sees soft-deleted rows; status
    /// changes and compensation still apply to them.
    pub async fn get_any<C: ConnectionTrait>(
        &self,
        db: &C,
        transaction_id: Uuid,
    ) -> ResultEngine<Transaction> {
        find_model(db, transaction_id)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("transaction not exists".to_string()))
            .and_then(Transaction::try_from)
    }
}

async fn find_model<C: ConnectionTrait>(
    db: &C,
    transaction_id: Uuid,
) -> ResultEngine<Option<transactions::Model>> {
    Ok(transactions::Entity::find_by_id(transaction_id.to_string())
        .one(db)
        .await?)
}
