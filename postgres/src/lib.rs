//! PostgreSQL implementation of the Dualis transactional store.
//!
//! One `kv` table hosts a whole store namespace; the command store and the
//! query store are either two databases or two pools over one, at the
//! deployment's discretion. See [`PostgresStore`].

pub mod schema;
pub mod store;

pub use store::PostgresStore;
