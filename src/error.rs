//! Core error types for The Small Dispatch.
//!
//! Every operation surfaces failures synchronously with a typed kind so the
//! caller can correct and resubmit. Nothing is downgraded to a warning and
//! there are no automatic retries in this core.

use thiserror::Error;

/// Result alias used across the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the dispatch core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested status is not reachable from the current status.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The shown delivery cost may never exceed the actual delivery cost.
    #[error("shown delivery cost {shown_cents} exceeds delivery cost {cost_cents} (cents)")]
    InconsistentFee { shown_cents: i64, cost_cents: i64 },

    /// A settlement or decrease exceeds the available balance.
    #[error("{attribute} balance too low: requested {requested_cents}, available {available_cents} (cents)")]
    InsufficientBalance {
        attribute: &'static str,
        requested_cents: i64,
        available_cents: i64,
    },

    /// A return quantity exceeds what remains deliverable for the item.
    #[error("return quantity {requested} exceeds remaining {available} for item {item_id}")]
    OverReturn {
        item_id: String,
        requested: i64,
        available: i64,
    },

    /// The acting shop or driver does not own the touched resource.
    #[error("actor does not own this resource")]
    OwnershipViolation,

    /// Malformed or missing input (empty reason, negative amount, bad items).
    #[error("{0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Underlying storage failure.
    #[error("database error: {0}")]
    Db(String),
}

impl CoreError {
    /// Stable machine-readable kind string for API payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::InconsistentFee { .. } => "InconsistentFee",
            CoreError::InsufficientBalance { .. } => "InsufficientBalance",
            CoreError::OverReturn { .. } => "OverReturn",
            CoreError::OwnershipViolation => "OwnershipViolation",
            CoreError::Validation(_) => "ValidationError",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Db(_) => "DbError",
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Db(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Db(format!("json: {err}"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        let e = CoreError::InvalidTransition {
            from: "delivered".into(),
            to: "pending".into(),
        };
        assert_eq!(e.kind(), "InvalidTransition");
        assert_eq!(CoreError::OwnershipViolation.kind(), "OwnershipViolation");
        assert_eq!(CoreError::validation("x").kind(), "ValidationError");
    }

    #[test]
    fn test_display_carries_context() {
        let e = CoreError::InsufficientBalance {
            attribute: "total_collected",
            requested_cents: 6000,
            available_cents: 4000,
        };
        let msg = e.to_string();
        assert!(msg.contains("6000"), "message should carry requested: {msg}");
        assert!(msg.contains("4000"), "message should carry available: {msg}");
    }
}
