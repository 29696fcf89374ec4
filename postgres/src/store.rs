//! Postgres implementation of the transactional store contract.
//!
//! The whole namespace lives in one `kv` table (`key TEXT PRIMARY KEY,
//! value BYTEA`). Postgres transactions provide the atomicity the command
//! and projection sides build on; prefix scans compile to ordered range
//! predicates over the primary key, so no `LIKE` and no sequential scans.
//!
//! # Locking
//!
//! `get` locks the key for the rest of the transaction: `FOR UPDATE` on the
//! row when it exists, a transaction-scoped advisory lock on the key hash
//! when it does not. Two transactions that read then write the same key
//! therefore serialize, and the second observes the first's committed
//! write. The optimistic version check and the outbox offset allocation
//! both rely on this.
//!
//! Every operation runs under a bounded timeout and surfaces
//! [`StoreError::Timeout`] when exceeded; a hung database never wedges a
//! handler or a worker.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row};

use dualis_core::store::{StoreError, StoreFuture, Transaction, TransactionalStore};

/// Default bound for a single store operation.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Postgres-backed [`TransactionalStore`].
///
/// # Example
///
/// ```ignore
/// let store = PostgresStore::connect("postgres://localhost/dualis").await?;
/// store.ensure_schema().await?;
///
/// let mut tx = store.begin().await?;
/// tx.put("agg/order/order-1", record_bytes).await?;
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PostgresStore {
    /// Connect to the database and build a pooled store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection cannot be
    /// established.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(DEFAULT_OP_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tracing::info!(max_connections = DEFAULT_MAX_CONNECTIONS, "Postgres store connected");
        Ok(Self::new(pool))
    }

    /// Build a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the per-operation timeout.
    #[must_use]
    pub const fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Create the `kv` table if it does not exist.
    ///
    /// Idempotent; call once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        crate::schema::ensure_schema(&self.pool).await
    }

    /// Access the underlying pool, e.g. for test cleanup.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TransactionalStore for PostgresStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(async move {
            let tx = bounded(self.op_timeout, self.pool.begin()).await?;
            Ok(Box::new(PostgresTransaction {
                tx,
                op_timeout: self.op_timeout,
            }) as Box<dyn Transaction>)
        })
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    op_timeout: Duration,
}

impl Transaction for PostgresTransaction {
    fn get(&mut self, key: &str) -> StoreFuture<'_, Option<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            // Writers race read-then-write on the same key (version check,
            // offset allocation); at READ COMMITTED a plain SELECT lets both
            // read the same value. FOR UPDATE serializes them on existing
            // rows, and the transaction-scoped advisory lock covers keys
            // that do not exist yet.
            bounded(
                self.op_timeout,
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind(key.clone())
                    .execute(&mut *self.tx),
            )
            .await?;
            let row = bounded(
                self.op_timeout,
                sqlx::query("SELECT value FROM kv WHERE key = $1 FOR UPDATE")
                    .bind(key)
                    .fetch_optional(&mut *self.tx),
            )
            .await?;
            match row {
                Some(row) => {
                    let value: Vec<u8> = row
                        .try_get("value")
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            bounded(
                self.op_timeout,
                sqlx::query(
                    "INSERT INTO kv (key, value) VALUES ($1, $2) \
                     ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(key)
                .bind(value)
                .execute(&mut *self.tx),
            )
            .await?;
            Ok(())
        })
    }

    fn delete(&mut self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            bounded(
                self.op_timeout,
                sqlx::query("DELETE FROM kv WHERE key = $1")
                    .bind(key)
                    .execute(&mut *self.tx),
            )
            .await?;
            Ok(())
        })
    }

    fn scan_prefix(
        &mut self,
        prefix: &str,
        from: Option<&str>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<(String, Vec<u8>)>> {
        let lower = match from {
            Some(from) if from > prefix => from.to_string(),
            _ => prefix.to_string(),
        };
        let upper = prefix_upper_bound(prefix);
        let prefix = prefix.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move {
            let query = match &upper {
                Some(upper) => sqlx::query(
                    "SELECT key, value FROM kv WHERE key >= $1 AND key < $2 \
                     ORDER BY key LIMIT $3",
                )
                .bind(lower)
                .bind(upper.clone())
                .bind(limit),
                None => {
                    sqlx::query("SELECT key, value FROM kv WHERE key >= $1 ORDER BY key LIMIT $2")
                        .bind(lower)
                        .bind(limit)
                }
            };
            let rows = bounded(self.op_timeout, query.fetch_all(&mut *self.tx)).await?;
            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let key: String = row
                    .try_get("key")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                // An all-0xFF prefix has no upper bound; the range query
                // then over-fetches and the prefix is enforced here.
                if !key.starts_with(&prefix) {
                    break;
                }
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                entries.push((key, value));
            }
            Ok(entries)
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            bounded(self.op_timeout, self.tx.commit()).await?;
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            bounded(self.op_timeout, self.tx.rollback()).await?;
            Ok(())
        })
    }
}

/// Run a sqlx future under the operation timeout, mapping both failure
/// modes into [`StoreError`].
async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(|e| StoreError::Backend(e.to_string())),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Smallest string strictly greater than every key with this prefix, if one
/// exists. Keys are ASCII (see `dualis_core::keys`), so incrementing the
/// last non-0xFF byte is exact.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(&last) = bytes.last() {
        if last < 0xFF {
            let end = bytes.len() - 1;
            bytes[end] = last + 1;
            return String::from_utf8(bytes).ok();
        }
        bytes.pop();
    }
    None
}
