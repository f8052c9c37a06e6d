//! The module contains the error the engine can throw.
//!
//! The errors are:
//!
//! - [`KeyNotFound`] thrown when a wallet or a transaction is not found.
//! - [`InsufficientFunds`] thrown when a debit exceeds the wallet balance.
//! - [`Conflict`] thrown when an optimistic-lock check fails or a reference
//!   is already taken.
//! - [`InvalidStateTransition`] thrown when a transaction status update is not
//!   permitted from its current status.
//! - [`ExternalService`] thrown when the payment provider is unreachable.
//! - [`Validation`] thrown on malformed input.
//!
//!  [`KeyNotFound`]: EngineError::KeyNotFound
//!  [`InsufficientFunds`]: EngineError::InsufficientFunds
//!  [`Conflict`]: EngineError::Conflict
//!  [`InvalidStateTransition`]: EngineError::InvalidStateTransition
//!  [`ExternalService`]: EngineError::ExternalService
//!  [`Validation`]: EngineError::Validation
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("External service error: {0}")]
    ExternalService(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl EngineError {
    /// Whether a job failing with this error should be attempted again.
    ///
    /// Lock conflicts, provider hiccups and storage errors may clear up on
    /// their own; the other variants will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::ExternalService(_) | Self::Database(_)
        )
    }

    /// Maps a unique-constraint violation to [`EngineError::Conflict`], any
    /// other database error is passed through.
    pub(crate) fn from_insert(err: DbErr, what: &str) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                Self::Conflict(format!("{what} already exists"))
            }
            _ => Self::Database(err),
        }
    }
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::InsufficientFunds(a), Self::InsufficientFunds(b)) => a == b,
            (Self::Conflict(a), Self::Conflict(b)) => a == b,
            (Self::InvalidStateTransition(a), Self::InvalidStateTransition(b)) => a == b,
            (Self::ExternalService(a), Self::ExternalService(b)) => a == b,
            (Self::Validation(a), Self::Validation(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(EngineError::Conflict("x".to_string()).is_retryable());
        assert!(EngineError::ExternalService("x".to_string()).is_retryable());
        assert!(EngineError::Database(DbErr::Custom("x".to_string())).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!EngineError::KeyNotFound("x".to_string()).is_retryable());
        assert!(!EngineError::InsufficientFunds("x".to_string()).is_retryable());
        assert!(!EngineError::InvalidStateTransition("x".to_string()).is_retryable());
        assert!(!EngineError::Validation("x".to_string()).is_retryable());
    }

    #[test]
    fn non_unique_insert_error_stays_database() {
        let err = EngineError::from_insert(DbErr::Custom("boom".to_string()), "transaction");
        assert!(matches!(err, EngineError::Database(_)));
    }
}
