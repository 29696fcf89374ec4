//! Aggregate identification, versioning, and the command decision contract.
//!
//! An aggregate is the write-side consistency boundary: a single entity
//! identified by an [`AggregateId`], mutated only through validated commands,
//! and versioned for optimistic concurrency control.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::event::Event;

/// Error type for [`AggregateId`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Unique identifier for an aggregate instance.
///
/// The same ID names the write-side aggregate record and the read-side
/// projection derived from it. For example:
/// - `"order-12345"`
/// - `"customer-abc-def"`
///
/// # Validation
///
/// - `FromStr::from_str()`: validates input (rejects empty strings)
/// - `From::from()` and `new()`: no validation (for application-controlled data)
///
/// # Examples
///
/// ```
/// use dualis_core::aggregate::AggregateId;
///
/// let id = AggregateId::new("order-12345");
/// assert_eq!(id.as_str(), "order-12345");
///
/// let parsed: AggregateId = "order-12345".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create a new `AggregateId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `AggregateId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseAggregateIdError(
                "Aggregate ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Aggregate version number for optimistic concurrency control.
///
/// Versions start at 0 (aggregate does not exist yet) and increment by 1 for
/// each committed command. A command submission carries the version the
/// caller last observed; a mismatch means a concurrent writer got there
/// first and the submission fails with a conflict instead of losing updates.
///
/// # Examples
///
/// ```
/// use dualis_core::aggregate::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert!(v0.is_initial());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The initial version (0): the aggregate has no committed state yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// # Overflow Behavior
    ///
    /// Reaching `u64::MAX` commits on a single aggregate is not a realistic
    /// concern; plain addition is used.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A command rejected by aggregate business rules.
///
/// Rejections are reported to the caller as validation errors. They never
/// produce a state change or an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Command rejected by rule '{rule}': {message}")]
pub struct Rejection {
    /// Short identifier of the violated rule (e.g. `"quantity-positive"`).
    pub rule: &'static str,
    /// Human-readable explanation.
    pub message: String,
}

impl Rejection {
    /// Create a new rejection for a named business rule.
    #[must_use]
    pub fn new(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

/// The write-side decision contract for an aggregate type.
///
/// `handle` is a pure function from the current state (or `None` for a new
/// aggregate) and a command to the next state plus exactly one domain event
/// describing the change. The command handler persists both atomically; the
/// decision itself performs no I/O.
///
/// Covering creation, updates, and cancellation through the same function
/// keeps the full command vocabulary in one match, checked at compile time.
///
/// # Example
///
/// ```ignore
/// impl Aggregate for Order {
///     type Command = OrderCommand;
///     type Event = OrderEvent;
///
///     fn aggregate_type() -> &'static str {
///         "order"
///     }
///
///     fn handle(state: Option<&Self>, command: OrderCommand) -> Result<(Self, OrderEvent), Rejection> {
///         match (state, command) {
///             (None, OrderCommand::Create { product, quantity, .. }) => {
///                 if quantity == 0 {
///                     return Err(Rejection::new("quantity-positive", "quantity must be > 0"));
///                 }
///                 // build the new state and the OrderCreated event
///                 # unimplemented!()
///             }
///             _ => Err(Rejection::new("unknown-transition", "command not valid in this state")),
///         }
///     }
/// }
/// ```
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    /// The command vocabulary for this aggregate type.
    type Command: Send + 'static;

    /// The domain events this aggregate emits.
    type Event: Event + Serialize + DeserializeOwned;

    /// Stable name of the aggregate type, used in store keys and envelopes.
    fn aggregate_type() -> &'static str;

    /// Validate a command against the current state and decide the outcome.
    ///
    /// `state` is `None` when no aggregate with the submitted ID exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection`] when a business rule is violated. A rejection
    /// must leave no trace: no state change, no event.
    fn handle(state: Option<&Self>, command: Self::Command) -> Result<(Self, Self::Event), Rejection>;
}

/// The stored write-side row for an aggregate: its version plus the
/// bincode-serialized state.
///
/// The record is what the command store actually holds under
/// `agg/{type}/{id}`; the version inside it is the source of truth for
/// optimistic concurrency checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Current committed version of the aggregate.
    pub version: Version,
    /// Bincode-serialized aggregate state.
    pub state: Vec<u8>,
}

impl AggregateRecord {
    /// Build a record from an aggregate state and its new version.
    ///
    /// # Errors
    ///
    /// Returns an error string if the state cannot be serialized. This is
    /// rare with bincode and indicates a non-serializable field.
    pub fn encode<A: Aggregate>(aggregate: &A, version: Version) -> Result<Self, String> {
        let state = bincode::serialize(aggregate).map_err(|e| e.to_string())?;
        Ok(Self { version, state })
    }

    /// Decode the stored state back into the aggregate type.
    ///
    /// # Errors
    ///
    /// Returns an error string if the stored bytes do not decode as `A`.
    pub fn decode<A: Aggregate>(&self) -> Result<A, String> {
        bincode::deserialize(&self.state).map_err(|e| e.to_string())
    }
}
