//! Read-side query handler over one projection's read models.
//!
//! Queries touch only the query store; the command store and the bus are
//! never consulted. Reads are eventually consistent: a model written by a
//! command is visible only after the projection engine has applied the
//! event, so `NotFound` right after a successful submit is normal
//! projection lag, not an error condition to alarm on.

use std::sync::Arc;

use thiserror::Error;

use dualis_core::aggregate::AggregateId;
use dualis_core::keys;
use dualis_core::projection::{Checkpoint, ProjectionTransform};
use dualis_core::store::{self, StoreError, TransactionalStore};

/// Errors reported to query callers.
#[derive(Error, Debug)]
pub enum QueryError {
    /// No read model exists for this aggregate (yet).
    #[error("No read model for {projection}/{aggregate_id}")]
    NotFound {
        /// The projection that was queried.
        projection: &'static str,
        /// The aggregate without a model.
        aggregate_id: AggregateId,
    },

    /// The query store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A stored model or checkpoint could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Serves reads from one projection's read models.
///
/// # Example
///
/// ```ignore
/// let queries = QueryHandler::new(query_store, Arc::new(OrderProjection));
///
/// match queries.get(&AggregateId::new("order-1")).await {
///     Ok(summary) => println!("{summary:?}"),
///     Err(QueryError::NotFound { .. }) => println!("not projected yet"),
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct QueryHandler<T: ProjectionTransform> {
    store: Arc<dyn TransactionalStore>,
    transform: Arc<T>,
}

impl<T: ProjectionTransform> QueryHandler<T> {
    /// Create a handler over the query store for one projection.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, transform: Arc<T>) -> Self {
        Self { store, transform }
    }

    /// Fetch the read model of one aggregate.
    ///
    /// # Errors
    ///
    /// - [`QueryError::NotFound`]: no model yet; expect this during
    ///   projection lag and after deletions
    /// - [`QueryError::Storage`]: the store failed or timed out
    pub async fn get(&self, aggregate_id: &AggregateId) -> Result<T::Model, QueryError> {
        let projection = self.transform.name();
        let key = keys::read_model(projection, aggregate_id);
        match store::get_one(self.store.as_ref(), &key).await? {
            Some(bytes) => decode_model(&bytes),
            None => Err(QueryError::NotFound {
                projection,
                aggregate_id: aggregate_id.clone(),
            }),
        }
    }

    /// All read models matching `filter`, in aggregate-ID order.
    ///
    /// The predicate runs in-process over each decoded model; the scan
    /// itself pages through the store so large projections do not load at
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on storage failure or a corrupt model.
    pub async fn list<F>(&self, filter: F) -> Result<Vec<T::Model>, QueryError>
    where
        F: Fn(&T::Model) -> bool,
    {
        let prefix = keys::read_model_prefix(self.transform.name());
        let mut models = Vec::new();
        let mut last_key: Option<String> = None;

        loop {
            let page =
                store::scan_one(self.store.as_ref(), &prefix, last_key.as_deref(), SCAN_PAGE)
                    .await?;
            let page_len = page.len();
            for (key, bytes) in page {
                if last_key.as_deref() == Some(&key) {
                    continue;
                }
                let model = decode_model(&bytes)?;
                if filter(&model) {
                    models.push(model);
                }
                last_key = Some(key);
            }
            if page_len < SCAN_PAGE {
                return Ok(models);
            }
        }
    }

    /// The projection's checkpoint for one aggregate: the last applied
    /// sequence, or `None` if nothing has been applied yet.
    ///
    /// Callers use this to observe projection progress, e.g. to wait until
    /// a known sequence has been applied before reading.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on storage failure or a corrupt checkpoint.
    pub async fn checkpoint(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Checkpoint>, QueryError> {
        let key = keys::checkpoint(self.transform.name(), aggregate_id);
        match store::get_one(self.store.as_ref(), &key).await? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| QueryError::Decode(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

const SCAN_PAGE: usize = 256;

fn decode_model<M: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<M, QueryError> {
    bincode::deserialize(bytes).map_err(|e| QueryError::Decode(e.to_string()))
}
