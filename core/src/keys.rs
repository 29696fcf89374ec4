//! Key encoding for the command and query stores.
//!
//! Both stores are flat key-value namespaces; these helpers keep the layout
//! in one place. Numeric components are zero-padded to 20 digits so the
//! store's lexicographic scan order equals numeric order (`u64::MAX` is 20
//! decimal digits).
//!
//! Command store:
//! - `agg/{type}/{id}` — aggregate record (version + state)
//! - `outbox/{offset:020}` — outbox row awaiting or past dispatch
//! - `outbox-cursor` — last dispatched outbox offset
//! - `outbox-next-offset` — next offset to assign
//!
//! Query store:
//! - `read/{projection}/{id}` — read model
//! - `ckpt/{projection}/{id}` — projection checkpoint
//! - `dlq/{projection}/{id}/{seq:020}` — dead-lettered event

use crate::aggregate::AggregateId;
use crate::event::SequenceNumber;

/// Prefix of all outbox rows.
pub const OUTBOX_PREFIX: &str = "outbox/";

/// Key holding the last dispatched outbox offset.
pub const OUTBOX_CURSOR_KEY: &str = "outbox-cursor";

/// Key holding the next outbox offset to assign.
pub const OUTBOX_NEXT_OFFSET_KEY: &str = "outbox-next-offset";

/// Key of an aggregate record.
#[must_use]
pub fn aggregate(aggregate_type: &str, id: &AggregateId) -> String {
    format!("agg/{aggregate_type}/{id}")
}

/// Key of an outbox row at a global offset.
#[must_use]
pub fn outbox(offset: u64) -> String {
    format!("{OUTBOX_PREFIX}{offset:020}")
}

/// Extract the offset back out of an outbox key.
#[must_use]
pub fn outbox_offset(key: &str) -> Option<u64> {
    key.strip_prefix(OUTBOX_PREFIX)?.parse().ok()
}

/// Key of a read model row.
#[must_use]
pub fn read_model(projection: &str, id: &AggregateId) -> String {
    format!("read/{projection}/{id}")
}

/// Prefix of all read model rows of one projection.
#[must_use]
pub fn read_model_prefix(projection: &str) -> String {
    format!("read/{projection}/")
}

/// Key of a projection checkpoint.
#[must_use]
pub fn checkpoint(projection: &str, id: &AggregateId) -> String {
    format!("ckpt/{projection}/{id}")
}

/// Key of a dead-letter entry.
#[must_use]
pub fn dead_letter(projection: &str, id: &AggregateId, sequence: SequenceNumber) -> String {
    format!("dlq/{projection}/{id}/{:020}", sequence.value())
}

/// Prefix of all dead-letter entries of one projection.
#[must_use]
pub fn dead_letter_prefix(projection: &str) -> String {
    format!("dlq/{projection}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_keys_sort_numerically() {
        let k9 = outbox(9);
        let k10 = outbox(10);
        let k100 = outbox(100);
        assert!(k9 < k10);
        assert!(k10 < k100);
    }

    #[test]
    fn outbox_offset_roundtrip() {
        assert_eq!(outbox_offset(&outbox(42)), Some(42));
        assert_eq!(outbox_offset("agg/order/1"), None);
    }

    #[test]
    fn aggregate_key_shape() {
        let id = AggregateId::new("order-1");
        assert_eq!(aggregate("order", &id), "agg/order/order-1");
    }

    #[test]
    fn read_model_key_under_prefix() {
        let id = AggregateId::new("order-1");
        let key = read_model("order-summary", &id);
        assert!(key.starts_with(&read_model_prefix("order-summary")));
    }
}
