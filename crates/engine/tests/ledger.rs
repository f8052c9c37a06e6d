use chrono::{Duration, Utc};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, TransactionTrait};
use uuid::Uuid;

use engine::{
    EngineError, EventBus, MoneyCents, TransactionKind, TransactionLedger, TransactionStatus,
    Wallet, WalletLedger,
};
use migration::MigratorTrait;

async fn ledgers_with_db() -> (WalletLedger, TransactionLedger, DatabaseConnection) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    (
        WalletLedger::new(),
        TransactionLedger::new(EventBus::new()),
        db,
    )
}

async fn file_db() -> (DatabaseConnection, std::path::PathBuf) {
    let root =
        std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target/test_dbs");
    std::fs::create_dir_all(&root).unwrap();

    let path = root.join(format!("ledger_{}.db", Uuid::new_v4()));
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let db = Database::connect(&url).await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    (db, path)
}

/// A wallet holding `cents` at version 1.
async fn funded_wallet(
    wallets: &WalletLedger,
    db: &DatabaseConnection,
    user_id: &str,
    cents: i64,
) -> Wallet {
    wallets.provision(db, user_id).await.unwrap();
    wallets
        .fund(db, user_id, MoneyCents::new(cents))
        .await
        .unwrap()
}

#[tokio::test]
async fn provision_starts_empty_and_rejects_a_second_wallet() {
    let (wallets, _, db) = ledgers_with_db().await;

    let wallet = wallets.provision(&db, "alice").await.unwrap();
    assert_eq!(wallet.balance, MoneyCents::ZERO);
    assert_eq!(wallet.version, 0);

    let err = wallets.provision(&db, "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn fund_creates_the_wallet_on_first_use() {
    let (wallets, _, db) = ledgers_with_db().await;

    let wallet = wallets
        .fund(&db, "bob", MoneyCents::new(2_500))
        .await
        .unwrap();
    assert_eq!(wallet.balance, MoneyCents::new(2_500));
    assert_eq!(wallet.version, 1);
    assert_eq!(wallets.wallet_by_user(&db, "bob").await.unwrap(), wallet);
}

#[tokio::test]
async fn debit_applies_and_bumps_version() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;
    assert_eq!(wallet.version, 1);

    let updated = wallets
        .debit(&db, wallet.id, MoneyCents::new(500), "BILL_a")
        .await
        .unwrap();
    assert_eq!(updated.balance, MoneyCents::new(500));
    assert_eq!(updated.version, 2);
}

#[tokio::test]
async fn debit_above_balance_is_rejected_and_leaves_wallet_untouched() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 500).await;

    let err = wallets
        .debit(&db, wallet.id, MoneyCents::new(2_000), "BILL_b")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds(_)));

    let after = wallets.wallet(&db, wallet.id).await.unwrap();
    assert_eq!(after.balance, MoneyCents::new(500));
    assert_eq!(after.version, 1);
}

#[tokio::test]
async fn non_positive_amounts_are_validation_errors() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 500).await;

    for cents in [0, -10] {
        let err = wallets
            .debit(&db, wallet.id, MoneyCents::new(cents), "BILL_c")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = wallets
            .credit(&db, wallet.id, MoneyCents::new(cents), "REV_c")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}

#[tokio::test]
async fn stale_snapshot_loses_the_compare_and_swap() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 500).await;

    // Both writers read version 1 before either writes.
    let first = wallets.wallet(&db, wallet.id).await.unwrap();
    let second = wallets.wallet(&db, wallet.id).await.unwrap();

    let won = wallets
        .debit_observed(&db, &first, MoneyCents::new(300), "BILL_first")
        .await
        .unwrap();
    assert_eq!(won.balance, MoneyCents::new(200));
    assert_eq!(won.version, 2);

    let err = wallets
        .debit_observed(&db, &second, MoneyCents::new(300), "BILL_second")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let after = wallets.wallet(&db, wallet.id).await.unwrap();
    assert_eq!(after.balance, MoneyCents::new(200));
    assert_eq!(after.version, 2);
}

#[tokio::test]
async fn stale_credit_is_rejected_too() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 500).await;
    let stale = wallets.wallet(&db, wallet.id).await.unwrap();

    wallets
        .credit(&db, wallet.id, MoneyCents::new(1), "REV_1")
        .await
        .unwrap();
    let err = wallets
        .credit_observed(&db, &stale, MoneyCents::new(1), "REV_2")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn credit_past_the_balance_limit_is_rejected() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", i64::MAX).await;

    let err = wallets
        .fund(&db, "alice", MoneyCents::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = wallets
        .credit(&db, wallet.id, MoneyCents::new(i64::MAX), "REV_big")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let unchanged = wallets.wallet(&db, wallet.id).await.unwrap();
    assert_eq!(unchanged.balance, MoneyCents::new(i64::MAX));
    assert_eq!(unchanged.version, 1);
}

#[tokio::test]
async fn concurrent_debits_have_exactly_one_winner() {
    let (db, path) = file_db().await;
    let wallets = WalletLedger::new();
    let wallet = funded_wallet(&wallets, &db, "alice", 500).await;

    let (a, b) = tokio::join!(
        wallets.debit(&db, wallet.id, MoneyCents::new(300), "BILL_x"),
        wallets.debit(&db, wallet.id, MoneyCents::new(300), "BILL_y"),
    );
    let results = [a, b];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(
                err,
                EngineError::Conflict(_) | EngineError::InsufficientFunds(_)
            ));
        }
    }

    let after = wallets.wallet(&db, wallet.id).await.unwrap();
    assert_eq!(after.balance, MoneyCents::new(200));
    assert_eq!(after.version, 2);

    drop(db);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn balance_never_goes_negative_over_a_sequence() {
    let (wallets, _, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;

    let mut expected_version = wallet.version;
    for (i, cents) in [400, 400, 400, 250, 100, 700, 300].into_iter().enumerate() {
        let reference = format!("BILL_{i}");
        let before = wallets.wallet(&db, wallet.id).await.unwrap();
        match wallets
            .debit(&db, wallet.id, MoneyCents::new(cents), &reference)
            .await
        {
            Ok(after) => {
                expected_version += 1;
                assert_eq!(after.balance, before.balance - MoneyCents::new(cents));
                assert_eq!(after.version, expected_version);
            }
            Err(EngineError::InsufficientFunds(_)) => {
                wallets
                    .credit(&db, wallet.id, MoneyCents::new(150), &format!("REV_{i}"))
                    .await
                    .unwrap();
                expected_version += 1;
            }
            Err(err) => panic!("unexpected error {err}"),
        }
        let now = wallets.wallet(&db, wallet.id).await.unwrap();
        assert!(!now.balance.is_negative());
        assert_eq!(now.version, expected_version);
    }
}

#[tokio::test]
async fn duplicate_reference_is_a_conflict() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;

    transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-100),
            TransactionKind::BillPayment,
            "BILL_dup",
            None,
        )
        .await
        .unwrap();
    let err = transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-100),
            TransactionKind::BillPayment,
            "BILL_dup",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(
        transactions.list_by_wallet(&db, wallet.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn failed_audit_write_rolls_back_the_debit() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;
    transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-1),
            TransactionKind::BillPayment,
            "BILL_taken",
            None,
        )
        .await
        .unwrap();

    {
        let db_tx = db.begin().await.unwrap();
        wallets
            .debit(&db_tx, wallet.id, MoneyCents::new(400), "BILL_taken")
            .await
            .unwrap();
        let err = transactions
            .record(
                &db_tx,
                wallet.id,
                MoneyCents::new(-400),
                TransactionKind::BillPayment,
                "BILL_taken",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        // Dropped without commit.
    }

    let after = wallets.wallet(&db, wallet.id).await.unwrap();
    assert_eq!(after.balance, MoneyCents::new(1_000));
    assert_eq!(after.version, 1);
}

#[tokio::test]
async fn status_follows_the_transition_table() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;
    let tx = transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-50),
            TransactionKind::BillPayment,
            "BILL_flow",
            None,
        )
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);

    let processing = transactions
        .advance(&db, tx.id, TransactionStatus::Processing, None, None)
        .await
        .unwrap();
    assert_eq!(processing.status, TransactionStatus::Processing);

    let completed = transactions
        .advance(
            &db,
            tx.id,
            TransactionStatus::Completed,
            Some("EXT_1"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.external_reference.as_deref(), Some("EXT_1"));
    assert_eq!(completed.amount, MoneyCents::new(-50));
    assert_eq!(completed.reference, "BILL_flow");

    for next in [
        TransactionStatus::Failed,
        TransactionStatus::Reversed,
        TransactionStatus::Processing,
        TransactionStatus::Completed,
    ] {
        let err = transactions
            .advance(&db, tx.id, next, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition(_)));
    }
}

#[tokio::test]
async fn failing_a_transaction_publishes_an_event() {
    let (wallets, _, db) = ledgers_with_db().await;
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let transactions = TransactionLedger::new(events);
    let wallet = funded_wallet(&wallets, &db, "alice", 100).await;
    let tx = transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-10),
            TransactionKind::BillPayment,
            "BILL_evt",
            None,
        )
        .await
        .unwrap();

    transactions
        .advance(&db, tx.id, TransactionStatus::Failed, None, Some("declined"))
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.name(), "transaction.failed");
    assert_eq!(event.transaction_id(), tx.id);
}

#[tokio::test]
async fn unknown_transaction_is_not_found() {
    let (_, transactions, db) = ledgers_with_db().await;
    let err = transactions
        .advance(&db, Uuid::new_v4(), TransactionStatus::Processing, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::KeyNotFound(_)));
    let err = transactions.by_reference(&db, "BILL_none").await.unwrap_err();
    assert!(matches!(err, EngineError::KeyNotFound(_)));
}

#[tokio::test]
async fn soft_deleted_rows_are_hidden_but_kept() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 100).await;
    let tx = transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-10),
            TransactionKind::BillPayment,
            "BILL_hidden",
            None,
        )
        .await
        .unwrap();

    transactions.soft_delete(&db, tx.id).await.unwrap();
    assert!(matches!(
        transactions.get(&db, tx.id).await,
        Err(EngineError::KeyNotFound(_))
    ));
    assert!(transactions.list_by_user(&db, "alice").await.unwrap().is_empty());
    assert_eq!(transactions.get_any(&db, tx.id).await.unwrap().id, tx.id);

    // The reference stays taken.
    let err = transactions
        .record(
            &db,
            wallet.id,
            MoneyCents::new(-10),
            TransactionKind::BillPayment,
            "BILL_hidden",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn failed_unreversed_finds_only_stuck_bill_payments() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;

    let mut ids = Vec::new();
    for reference in ["BILL_stuck", "BILL_done", "BILL_linked"] {
        let tx = transactions
            .record(
                &db,
                wallet.id,
                MoneyCents::new(-10),
                TransactionKind::BillPayment,
                reference,
                None,
            )
            .await
            .unwrap();
        ids.push(tx.id);
    }
    transactions
        .advance(&db, ids[0], TransactionStatus::Failed, None, Some("down"))
        .await
        .unwrap();
    transactions
        .advance(&db, ids[1], TransactionStatus::Completed, None, None)
        .await
        .unwrap();
    transactions
        .advance(&db, ids[2], TransactionStatus::Failed, None, None)
        .await
        .unwrap();
    transactions
        .link_reversal(&db, ids[2], Uuid::new_v4())
        .await
        .unwrap();

    let stuck = transactions
        .failed_unreversed(&db, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, ids[0]);
    assert_eq!(stuck[0].failure_reason.as_deref(), Some("down"));

    let none = transactions
        .failed_unreversed(&db, Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn listing_is_newest_first_and_requires_a_wallet() {
    let (wallets, transactions, db) = ledgers_with_db().await;
    let wallet = funded_wallet(&wallets, &db, "alice", 1_000).await;
    for reference in ["BILL_1", "BILL_2", "BILL_3"] {
        transactions
            .record(
                &db,
                wallet.id,
                MoneyCents::new(-1),
                TransactionKind::BillPayment,
                reference,
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let listed = transactions.list_by_user(&db, "alice").await.unwrap();
    let references: Vec<&str> = listed.iter().map(|t| t.reference.as_str()).collect();
    assert_eq!(references, ["BILL_3", "BILL_2", "BILL_1"]);

    let err = transactions.list_by_user(&db, "nobody").await.unwrap_err();
    assert!(matches!(err, EngineError::KeyNotFound(_)));

    // Raw rows agree with the ledger.
    let backend = db.get_database_backend();
    let row = db
        .query_one(sea_orm::Statement::from_string(
            backend,
            "SELECT COUNT(*) AS n FROM transactions",
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("", "n").unwrap(), 3);
}
