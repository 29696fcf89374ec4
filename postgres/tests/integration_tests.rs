//! Integration tests for `PostgresStore` against a real database.
//!
//! Ignored by default; run with a reachable database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/dualis_test cargo test -p dualis-postgres -- --ignored
//! ```
//!
//! Keys are prefixed per test with a random ID so runs do not interfere.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dualis_command::{CommandError, CommandHandler};
use dualis_core::aggregate::{Aggregate, AggregateId, Rejection, Version};
use dualis_core::event::Event;
use dualis_core::store::{StoreError, TransactionalStore};
use dualis_postgres::PostgresStore;
use dualis_testing::test_clock;
use uuid::Uuid;

async fn store() -> PostgresStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    let store = PostgresStore::connect(&url)
        .await
        .expect("failed to connect");
    store.ensure_schema().await.expect("failed to ensure schema");
    store
}

fn test_prefix() -> String {
    format!("test/{}/", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn put_get_commit_roundtrip() {
    let store = store().await;
    let prefix = test_prefix();
    let key = format!("{prefix}k1");

    let mut tx = store.begin().await.unwrap();
    tx.put(&key, b"v1".to_vec()).await.unwrap();
    assert_eq!(tx.get(&key).await.unwrap(), Some(b"v1".to_vec()));
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get(&key).await.unwrap(), Some(b"v1".to_vec()));
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn rollback_discards_writes() {
    let store = store().await;
    let prefix = test_prefix();
    let key = format!("{prefix}k1");

    let mut tx = store.begin().await.unwrap();
    tx.put(&key, b"v1".to_vec()).await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get(&key).await.unwrap(), None);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn upsert_overwrites() {
    let store = store().await;
    let prefix = test_prefix();
    let key = format!("{prefix}k1");

    let mut tx = store.begin().await.unwrap();
    tx.put(&key, b"v1".to_vec()).await.unwrap();
    tx.put(&key, b"v2".to_vec()).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get(&key).await.unwrap(), Some(b"v2".to_vec()));
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn delete_removes_key() {
    let store = store().await;
    let prefix = test_prefix();
    let key = format!("{prefix}k1");

    let mut tx = store.begin().await.unwrap();
    tx.put(&key, b"v1".to_vec()).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.delete(&key).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get(&key).await.unwrap(), None);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn scan_is_ordered_bounded_and_resumable() {
    let store = store().await;
    let prefix = test_prefix();

    let mut tx = store.begin().await.unwrap();
    for i in [3u8, 1, 2, 5, 4] {
        tx.put(&format!("{prefix}{i:020}"), vec![i]).await.unwrap();
    }
    tx.put(&format!("unrelated/{prefix}"), b"x".to_vec())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let all = tx.scan_prefix(&prefix, None, 10).await.unwrap();
    assert_eq!(all.len(), 5);
    let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);

    let limited = tx.scan_prefix(&prefix, None, 2).await.unwrap();
    assert_eq!(limited.len(), 2);

    let from = format!("{prefix}{:020}", 3);
    let resumed = tx.scan_prefix(&prefix, Some(&from), 10).await.unwrap();
    assert_eq!(resumed.len(), 3);
    assert_eq!(resumed[0].0, from);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn connect_failure_is_backend_error() {
    let result = PostgresStore::connect("postgres://invalid-host-name-for-test/none").await;
    assert!(matches!(result, Err(StoreError::Backend(_))));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn racing_read_then_write_transactions_serialize() {
    let store = store().await;
    let prefix = test_prefix();
    let key = format!("{prefix}slot");

    // The same read-then-write shape as the version check and the outbox
    // offset allocation: only create the key if it was observed absent.
    let claim = |store: PostgresStore, key: String, value: Vec<u8>| async move {
        let mut tx = store.begin().await.unwrap();
        if tx.get(&key).await.unwrap().is_some() {
            tx.rollback().await.unwrap();
            return false;
        }
        tx.put(&key, value).await.unwrap();
        tx.commit().await.unwrap();
        true
    };

    let (first, second) = tokio::join!(
        tokio::spawn(claim(store.clone(), key.clone(), b"a".to_vec())),
        tokio::spawn(claim(store.clone(), key.clone(), b"b".to_vec())),
    );
    let created = [first.unwrap(), second.unwrap()];
    assert_eq!(created.iter().filter(|c| **c).count(), 1);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Register {
    value: i64,
}

enum RegisterCommand {
    Set(i64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum RegisterEvent {
    Set { value: i64 },
}

impl Event for RegisterEvent {
    fn event_type(&self) -> &'static str {
        "RegisterSet.v1"
    }
}

impl Aggregate for Register {
    type Command = RegisterCommand;
    type Event = RegisterEvent;

    fn aggregate_type() -> &'static str {
        "register"
    }

    fn handle(
        _state: Option<&Self>,
        command: Self::Command,
    ) -> Result<(Self, Self::Event), Rejection> {
        let RegisterCommand::Set(value) = command;
        Ok((Self { value }, RegisterEvent::Set { value }))
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_submits_conflict_exactly_once() {
    let store = Arc::new(store().await);
    let handler = CommandHandler::<Register>::new(store, Arc::new(test_clock()));
    let id = AggregateId::new(format!("reg-{}", Uuid::new_v4()));

    let (first, second) = tokio::join!(
        handler.submit(id.clone(), Some(Version::INITIAL), RegisterCommand::Set(1)),
        handler.submit(id.clone(), Some(Version::INITIAL), RegisterCommand::Set(2)),
    );

    assert_eq!(
        [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count(),
        1
    );
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(CommandError::Conflict { .. })));
}
