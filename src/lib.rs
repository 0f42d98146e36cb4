//! The Small Dispatch - last-mile delivery & COD coordination core.
//!
//! Shops create packages, drivers carry them through pickup and delivery,
//! and the platform tracks cash-on-delivery money on the shops' behalf.
//! This crate is the domain core behind the REST surface: the package
//! lifecycle state machine, the per-shop money ledger with its append-only
//! transaction log, the return/exchange reconciler, assignment tracking,
//! pickup batches, and the event outbox the external notifier drains.
//!
//! Presentation, authentication and notification transport live outside;
//! requests arrive as an authenticated [`Actor`] plus a JSON payload and
//! are answered synchronously with a JSON value or a typed [`CoreError`].

use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod assignment;
pub mod auth;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod money;
pub mod packages;
pub mod pickups;
pub mod reconcile;
pub mod shops;
pub mod status;
pub mod transitions;

pub use auth::Actor;
pub use db::DbState;
pub use error::{CoreError, CoreResult};
pub use status::PackageStatus;

/// Initialize tracing for binaries and tools embedding the core.
///
/// Honors `RUST_LOG`; defaults to info with debug for this crate. Safe to
/// call more than once.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_dispatch=debug"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .try_init();
}

/// First non-empty string field among `keys`, trimmed.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_str_trims_and_skips_empty() {
        let payload = serde_json::json!({
            "a": "  hello  ",
            "b": "   ",
            "c": 5,
        });
        assert_eq!(value_str(&payload, &["a"]), Some("hello".to_string()));
        assert_eq!(value_str(&payload, &["b", "a"]), Some("hello".to_string()));
        assert_eq!(value_str(&payload, &["c"]), None);
        assert_eq!(value_str(&payload, &["missing"]), None);
    }
}
