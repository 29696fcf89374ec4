//! The minimal transactional store contract both sides depend on.
//!
//! The command store and the query store are black boxes behind this
//! interface: begin a transaction, read and write keys, commit or roll
//! back. Anything that satisfies it — Postgres, an embedded KV engine, an
//! in-memory map — can host either side.
//!
//! # Atomicity
//!
//! The two core guarantees of the system hang off transaction atomicity:
//!
//! - the aggregate write and its outbox row commit together or not at all
//! - the read-model upsert and the checkpoint advance commit together or
//!   not at all
//!
//! # Ordering
//!
//! [`Transaction::scan_prefix`] returns keys in ascending lexicographic
//! order. Offsets and sequence numbers are zero-padded in keys (see
//! [`crate::keys`]) so scan order equals numeric order.
//!
//! # Dyn Compatibility
//!
//! The traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` to enable trait object usage (`Arc<dyn TransactionalStore>`),
//! which the handlers and the projection engine rely on.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backing storage engine failed (connection, query, constraint).
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The operation exceeded its bounded timeout.
    ///
    /// Store operations never block indefinitely; exceeding the bound is an
    /// explicit failure the caller can retry.
    #[error("Storage operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The store has been shut down and accepts no further operations.
    #[error("Store is closed")]
    Closed,
}

/// Boxed future alias used by the store traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// An open transaction against a store.
///
/// All reads observe a consistent snapshot including the transaction's own
/// writes. Dropping a transaction without committing rolls it back; a
/// failed or cancelled operation therefore leaves the store untouched.
pub trait Transaction: Send {
    /// Read the value stored under `key`, if any.
    fn get(&mut self, key: &str) -> StoreFuture<'_, Option<Vec<u8>>>;

    /// Stage a write of `value` under `key` (insert or overwrite).
    fn put(&mut self, key: &str, value: Vec<u8>) -> StoreFuture<'_, ()>;

    /// Stage a deletion of `key`. Deleting an absent key is a no-op.
    fn delete(&mut self, key: &str) -> StoreFuture<'_, ()>;

    /// Read entries whose key starts with `prefix`, in ascending key order,
    /// up to `limit` entries.
    ///
    /// When `from` is `Some(key)`, only entries with keys `>= key` are
    /// returned — the outbox dispatcher uses this to resume scanning after
    /// its cursor instead of rereading the whole prefix.
    fn scan_prefix(
        &mut self,
        prefix: &str,
        from: Option<&str>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<(String, Vec<u8>)>>;

    /// Durably commit all staged writes.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discard all staged writes.
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// A store that can open transactions.
///
/// Implementations must be `Send + Sync`; the command handler, outbox
/// dispatcher, and projection workers all hold the store behind an `Arc`.
pub trait TransactionalStore: Send + Sync {
    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is closed or a connection cannot
    /// be acquired within the configured timeout.
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>>;
}

/// Read a single key outside of any caller-visible transaction.
///
/// Convenience for read-only paths (queries, checkpoint peeks): opens a
/// transaction, reads, and rolls back.
///
/// # Errors
///
/// Returns [`StoreError`] if the read fails.
pub async fn get_one(
    store: &dyn TransactionalStore,
    key: &str,
) -> Result<Option<Vec<u8>>, StoreError> {
    let mut tx = store.begin().await?;
    let value = match tx.get(key).await {
        Ok(value) => value,
        Err(e) => {
            tx.rollback().await.ok();
            return Err(e);
        }
    };
    tx.rollback().await?;
    Ok(value)
}

/// Scan a prefix outside of any caller-visible transaction.
///
/// # Errors
///
/// Returns [`StoreError`] if the scan fails.
pub async fn scan_one(
    store: &dyn TransactionalStore,
    prefix: &str,
    from: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let mut tx = store.begin().await?;
    let entries = match tx.scan_prefix(prefix, from, limit).await {
        Ok(entries) => entries,
        Err(e) => {
            tx.rollback().await.ok();
            return Err(e);
        }
    };
    tx.rollback().await?;
    Ok(entries)
}
