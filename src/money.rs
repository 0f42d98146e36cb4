//! Money parsing and formatting helpers.
//!
//! All balances and amounts are stored and computed as integer cents so
//! replaying the transaction log reproduces balances exactly. The JSON
//! boundary carries two-fraction decimal values and accepts both numbers
//! and numeric strings (`100`, `100.5`, `"100.50"`).

use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Largest accepted magnitude, in major units (sanity bound for inputs).
const MAX_MAJOR: f64 = 1_000_000_000.0;

/// Convert a major-unit amount to cents, rounding to two fractions.
///
/// Returns `None` for non-finite or absurdly large values.
pub fn cents_from_major(amount: f64) -> Option<i64> {
    if !amount.is_finite() || amount.abs() > MAX_MAJOR {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

/// Convert cents back to a major-unit decimal for JSON output.
pub fn major_from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Extract a money field from a JSON payload as cents.
///
/// Accepts a JSON number or a numeric string. Returns `Ok(None)` when the
/// field is absent or null, `ValidationError` when present but malformed.
pub fn cents_field(payload: &Value, keys: &[&str]) -> CoreResult<Option<i64>> {
    for key in keys {
        match payload.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => {
                let amount = n
                    .as_f64()
                    .and_then(cents_from_major)
                    .ok_or_else(|| CoreError::validation(format!("Invalid amount in '{key}'")))?;
                return Ok(Some(amount));
            }
            Some(Value::String(s)) => {
                let amount = s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(cents_from_major)
                    .ok_or_else(|| CoreError::validation(format!("Invalid amount in '{key}'")))?;
                return Ok(Some(amount));
            }
            Some(_) => {
                return Err(CoreError::validation(format!(
                    "Field '{key}' must be a decimal amount"
                )))
            }
        }
    }
    Ok(None)
}

/// Like [`cents_field`] but the field is mandatory.
pub fn require_cents(payload: &Value, keys: &[&str]) -> CoreResult<i64> {
    cents_field(payload, keys)?.ok_or_else(|| {
        CoreError::validation(format!(
            "Missing amount field '{}'",
            keys.first().copied().unwrap_or("amount")
        ))
    })
}

/// A mandatory, strictly positive money field.
pub fn require_positive_cents(payload: &Value, keys: &[&str]) -> CoreResult<i64> {
    let cents = require_cents(payload, keys)?;
    if cents <= 0 {
        return Err(CoreError::validation("Amount must be positive"));
    }
    Ok(cents)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cents_from_major_rounds_two_fractions() {
        assert_eq!(cents_from_major(100.0), Some(10000));
        assert_eq!(cents_from_major(100.005), Some(10001));
        assert_eq!(cents_from_major(0.1 + 0.2), Some(30));
        assert_eq!(cents_from_major(f64::NAN), None);
        assert_eq!(cents_from_major(f64::INFINITY), None);
    }

    #[test]
    fn test_major_from_cents_round_trip() {
        assert_eq!(major_from_cents(10050), 100.5);
        assert_eq!(major_from_cents(0), 0.0);
    }

    #[test]
    fn test_cents_field_accepts_number_and_string() {
        let payload = json!({ "amount": 12.34 });
        assert_eq!(cents_field(&payload, &["amount"]).unwrap(), Some(1234));

        let payload = json!({ "amount": "12.34" });
        assert_eq!(cents_field(&payload, &["amount"]).unwrap(), Some(1234));

        let payload = json!({ "other": 1 });
        assert_eq!(cents_field(&payload, &["amount"]).unwrap(), None);
    }

    #[test]
    fn test_cents_field_rejects_garbage() {
        let payload = json!({ "amount": "not money" });
        assert!(cents_field(&payload, &["amount"]).is_err());

        let payload = json!({ "amount": [1, 2] });
        assert!(cents_field(&payload, &["amount"]).is_err());
    }

    #[test]
    fn test_require_positive_cents() {
        assert!(require_positive_cents(&json!({ "amount": 0 }), &["amount"]).is_err());
        assert!(require_positive_cents(&json!({ "amount": -5 }), &["amount"]).is_err());
        assert_eq!(
            require_positive_cents(&json!({ "amount": 5 }), &["amount"]).unwrap(),
            500
        );
        assert!(require_positive_cents(&json!({}), &["amount"]).is_err());
    }
}
