//! PostgreSQL 账户存储测试
//!
//! 需要可用的数据库：`TEST_DATABASE_URL=postgres://... cargo test -- --ignored`

use rust_decimal_macros::dec;
use sqlx::PgPool;

use balance_reconciler::{AccountStore, ApplyOutcome, BalanceMutation, PgAccountStore, ReconcileError};
use payment_shared::config::ReversalPolicy;
use payment_shared::database::Database;
use payment_shared::events::{AccountKind, PaymentEventType};

async fn setup() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    Database::from_pool(pool.clone())
        .run_migrations()
        .await
        .expect("run migrations");
    pool
}

/// 新建一个客户和一张卡，返回 (customer_id, card_id)
async fn open_accounts(pool: &PgPool) -> (i64, i64) {
    let suffix = chrono::Utc::now().timestamp_micros();
    let customer_id: i64 = sqlx::query_scalar(
        "INSERT INTO customers (first_name, last_name, email, balance) VALUES ('Test', 'User', $1, 300) RETURNING id",
    )
    .bind(format!("user{suffix}@example.com"))
    .fetch_one(pool)
    .await
    .unwrap();

    let card_id: i64 = sqlx::query_scalar(
        "INSERT INTO cards (customer_id, card_number, card_type, balance) VALUES ($1, $2, 'DEBIT', 1000) RETURNING id",
    )
    .bind(customer_id)
    .bind(format!("{:016}", suffix % 10_000_000_000_000_000))
    .fetch_one(pool)
    .await
    .unwrap();

    (customer_id, card_id)
}

fn mutation(payment_id: i64, event_type: PaymentEventType, card_id: i64) -> BalanceMutation {
    BalanceMutation {
        payment_id,
        event_type,
        account_kind: AccountKind::Card,
        account_id: card_id,
        delta: match event_type {
            PaymentEventType::Created => dec!(-50.00),
            PaymentEventType::Cancelled => dec!(50.00),
        },
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_apply_once_is_idempotent() {
    let pool = setup().await;
    let (_, card_id) = open_accounts(&pool).await;
    let store = PgAccountStore::new(pool);
    let payment_id = chrono::Utc::now().timestamp_micros();

    let created = mutation(payment_id, PaymentEventType::Created, card_id);
    assert_eq!(
        store.apply_once(&created, ReversalPolicy::Unconditional).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(
        store.apply_once(&created, ReversalPolicy::Unconditional).await.unwrap(),
        ApplyOutcome::Duplicate
    );
    assert_eq!(
        store.balance(AccountKind::Card, card_id).await.unwrap(),
        Some(dec!(950.00))
    );

    let cancelled = mutation(payment_id, PaymentEventType::Cancelled, card_id);
    assert_eq!(
        store.apply_once(&cancelled, ReversalPolicy::RequireAppliedDebit).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(
        store.balance(AccountKind::Card, card_id).await.unwrap(),
        Some(dec!(1000.00))
    );
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_missing_account_rolls_back_dedup_record() {
    let pool = setup().await;
    let store = PgAccountStore::new(pool.clone());
    let payment_id = chrono::Utc::now().timestamp_micros();

    let err = store
        .apply_once(
            &mutation(payment_id, PaymentEventType::Created, i64::MAX),
            ReversalPolicy::Unconditional,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::AccountNotFound { .. }));

    let recorded: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM balance_mutations WHERE payment_id = $1)",
    )
    .bind(payment_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(!recorded);
}
