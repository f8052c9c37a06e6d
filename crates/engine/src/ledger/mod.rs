//! The two ledgers.
//!
//! [`WalletLedger`] owns balances, [`TransactionLedger`] owns the audit
//! trail. Neither knows about the other; code that needs a balance change
//! and its record in one atomic unit (the saga) drives both.

mod transaction;
mod wallet;

pub use transaction::TransactionLedger;
pub use wallet::WalletLedger;
