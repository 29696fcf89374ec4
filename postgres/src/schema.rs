//! Schema bootstrap for the `kv` table.

use sqlx::PgPool;

use dualis_core::store::StoreError;

/// Create the `kv` table if it does not exist. Idempotent.
///
/// The primary key on `key` gives ordered range scans their index; no
/// secondary indexes are needed.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if the DDL fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value BYTEA NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Backend(e.to_string()))?;
    tracing::debug!("kv schema ensured");
    Ok(())
}
