//! In-memory transactional store for fast, deterministic testing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

use dualis_core::store::{StoreError, StoreFuture, Transaction, TransactionalStore};

/// In-memory [`TransactionalStore`] backed by a `BTreeMap`.
///
/// Transactions hold the whole-store lock for their lifetime, so they are
/// fully serialized: trivially atomic and isolated, which is exactly what
/// the handler and engine invariants assume of the production store.
/// Writes are staged and applied only on commit; dropping a transaction
/// (or rolling back) leaves the store untouched.
///
/// Note: beginning a second transaction while holding an open one on the
/// same task deadlocks, as it would against a single-connection database.
///
/// # Example
///
/// ```
/// use dualis_testing::InMemoryStore;
/// use dualis_core::store::TransactionalStore;
///
/// # async fn example() -> Result<(), dualis_core::store::StoreError> {
/// let store = InMemoryStore::new();
///
/// let mut tx = store.begin().await?;
/// tx.put("agg/order/1", b"state".to_vec()).await?;
/// tx.commit().await?;
///
/// assert_eq!(store.len().await, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the store: further `begin` calls fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of committed entries.
    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    /// Whether the store has no committed entries.
    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }

    /// Snapshot of all committed keys, in order. Useful for assertions.
    pub async fn keys(&self) -> Vec<String> {
        self.data.lock().await.keys().cloned().collect()
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<BTreeMap<String, Vec<u8>>>,
    /// Staged writes: `Some` = put, `None` = delete.
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl Transaction for InMemoryTransaction {
    fn get(&mut self, key: &str) -> StoreFuture<'_, Option<Vec<u8>>> {
        let value = match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.guard.get(key).cloned(),
        };
        Box::pin(async move { Ok(value) })
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> StoreFuture<'_, ()> {
        self.staged.insert(key.to_string(), Some(value));
        Box::pin(async { Ok(()) })
    }

    fn delete(&mut self, key: &str) -> StoreFuture<'_, ()> {
        self.staged.insert(key.to_string(), None);
        Box::pin(async { Ok(()) })
    }

    fn scan_prefix(
        &mut self,
        prefix: &str,
        from: Option<&str>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<(String, Vec<u8>)>> {
        let start = match from {
            Some(from) if from > prefix => from.to_string(),
            _ => prefix.to_string(),
        };
        // Merge committed entries with staged overrides, both in key order.
        let mut merged: BTreeMap<String, Vec<u8>> = self
            .guard
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, staged) in self.staged.range(start..) {
            if !key.starts_with(prefix) {
                break;
            }
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let entries: Vec<(String, Vec<u8>)> = merged.into_iter().take(limit).collect();
        Box::pin(async move { Ok(entries) })
    }

    fn commit(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        for (key, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Some(value) => {
                    self.guard.insert(key, value);
                }
                None => {
                    self.guard.remove(&key);
                }
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        // Staged writes are simply dropped with the transaction.
        Box::pin(async { Ok(()) })
    }
}

impl TransactionalStore for InMemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        let data = Arc::clone(&self.data);
        let closed = self.closed.load(Ordering::SeqCst);
        Box::pin(async move {
            if closed {
                return Err(StoreError::Closed);
            }
            let guard = data.lock_owned().await;
            Ok(Box::new(InMemoryTransaction {
                guard,
                staged: BTreeMap::new(),
            }) as Box<dyn Transaction>)
        })
    }
}
