//! Return and exchange reconciliation for delivered packages.
//!
//! Computes the financial and inventory delta when a delivered package is
//! partially returned or exchanged and feeds the correction into the shop
//! ledger. Both operations are legal only while the package sits in
//! `delivered`; the `return-*` status sub-chain advances separately,
//! through explicit status changes.
//!
//! **Rules:**
//! - Cumulative returned quantities can never exceed what was delivered
//! - The refund amount is caller-supplied (a partial-value return is a
//!   business decision, never derived from item prices here)
//! - Only one exchange is in flight per package; a new request replaces
//!   the pending one
//! - Exchange items are not cross-checked against the original order, but
//!   the cash delta must be a finite, non-negative magnitude

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::info;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::events;
use crate::ledger;
use crate::money;
use crate::packages::PackageRow;
use crate::status::PackageStatus;
use crate::value_str;

// ---------------------------------------------------------------------------
// Returns
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ReturnItem {
    item_id: String,
    quantity: i64,
}

fn parse_return_items(payload: &Value) -> CoreResult<Vec<ReturnItem>> {
    let list = payload
        .get("items")
        .and_then(Value::as_array)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| CoreError::validation("A return needs at least one item"))?;

    let mut items = Vec::with_capacity(list.len());
    for entry in list {
        let item_id = value_str(entry, &["itemId", "item_id"])
            .ok_or_else(|| CoreError::validation("Return item missing itemId"))?;
        let quantity = entry
            .get("quantity")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::validation("Return item missing quantity"))?;
        if quantity <= 0 {
            return Err(CoreError::validation(
                "Return quantities must be positive",
            ));
        }
        if items.iter().any(|i: &ReturnItem| i.item_id == item_id) {
            return Err(CoreError::validation(format!(
                "Duplicate item in return request: {item_id}"
            )));
        }
        items.push(ReturnItem { item_id, quantity });
    }
    Ok(items)
}

/// Quantity lookup from a `[{itemId, <key>}]` JSON column.
fn quantity_map(details: Option<&Value>, key: &str) -> Vec<(String, i64)> {
    details
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let id = e.get("itemId").and_then(Value::as_str)?;
                    let qty = e.get(key).and_then(Value::as_i64)?;
                    Some((id.to_string(), qty))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Record a (possibly partial) customer return against a delivered package.
///
/// Validates every requested quantity against the delivered remainder,
/// accumulates `return_details`, and releases the caller-supplied refund
/// from the shop's collected balance. Everything commits atomically.
pub fn request_return(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let requested = parse_return_items(payload)?;
    let refund_cents = money::cents_field(payload, &["refundAmount", "refund_amount"])?
        .unwrap_or(0);
    if refund_cents < 0 {
        return Err(CoreError::validation("Refund amount must not be negative"));
    }

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        auth::ensure_shop_scope(actor, &pkg.shop_id)?;

        if pkg.status != PackageStatus::Delivered {
            return Err(CoreError::InvalidTransition {
                from: pkg.status.as_str().to_string(),
                to: PackageStatus::ReturnRequested.as_str().to_string(),
            });
        }

        let delivered = quantity_map(pkg.delivered_items.as_ref(), "deliveredQuantity");
        let already = quantity_map(pkg.return_details.as_ref(), "quantity");

        let mut merged = already.clone();
        for item in &requested {
            let Some((_, delivered_qty)) = delivered.iter().find(|(id, _)| *id == item.item_id)
            else {
                return Err(CoreError::validation(format!(
                    "Unknown item in return request: {}",
                    item.item_id
                )));
            };
            let already_qty = already
                .iter()
                .find(|(id, _)| *id == item.item_id)
                .map(|(_, q)| *q)
                .unwrap_or(0);
            let available = delivered_qty - already_qty;
            if item.quantity > available {
                return Err(CoreError::OverReturn {
                    item_id: item.item_id.clone(),
                    requested: item.quantity,
                    available,
                });
            }
            match merged.iter_mut().find(|(id, _)| *id == item.item_id) {
                Some(slot) => slot.1 += item.quantity,
                None => merged.push((item.item_id.clone(), item.quantity)),
            }
        }

        let merged_json: Vec<Value> = merged
            .iter()
            .map(|(id, qty)| serde_json::json!({ "itemId": id, "quantity": qty }))
            .collect();
        let new_refund_total = pkg.return_refund_cents + refund_cents;
        conn.execute(
            "UPDATE packages SET return_details = ?1, return_refund_cents = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                Value::Array(merged_json.clone()).to_string(),
                new_refund_total,
                Utc::now().to_rfc3339(),
                package_id,
            ],
        )
        .map_err(|e| CoreError::Db(format!("record return: {e}")))?;

        ledger::on_return_or_exchange(
            &conn,
            &pkg.shop_id,
            &pkg.id,
            -refund_cents,
            "Return refund to customer",
        )?;

        if refund_cents > 0 {
            events::record_event(
                &conn,
                "shop.ledgerAdjusted",
                &pkg.shop_id,
                &serde_json::json!({
                    "operation": "return",
                    "packageId": pkg.id,
                    "amount": money::major_from_cents(refund_cents),
                }),
            )?;
        }

        Ok(serde_json::json!({
            "success": true,
            "packageId": pkg.id,
            "returnDetails": merged_json,
            "refundAmount": money::major_from_cents(refund_cents),
            "totalRefunded": money::major_from_cents(new_refund_total),
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                package_id = %package_id,
                refund = %v["refundAmount"],
                "Return recorded"
            );
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

fn parse_exchange_items(payload: &Value, key: &str) -> CoreResult<Value> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(Value::Array(vec![])),
        Some(Value::Array(list)) => Ok(Value::Array(list.clone())),
        Some(_) => Err(CoreError::validation(format!(
            "Field '{key}' must be a list"
        ))),
    }
}

/// Record an exchange against a delivered package.
///
/// Attaches `exchange_details` (replacing any pending exchange) and feeds
/// the signed cash delta into the shop ledger. The package status does not
/// move.
pub fn request_exchange(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let take_items = parse_exchange_items(payload, "takeItems")?;
    let give_items = parse_exchange_items(payload, "giveItems")?;

    let delta = payload
        .get("cashDelta")
        .ok_or_else(|| CoreError::validation("Missing cashDelta"))?;
    let direction = value_str(delta, &["direction"])
        .ok_or_else(|| CoreError::validation("cashDelta needs a direction (give/take)"))?;
    if direction != "give" && direction != "take" {
        return Err(CoreError::validation(format!(
            "Invalid cashDelta direction: {direction}. Must be give or take"
        )));
    }
    let amount_cents = money::require_cents(delta, &["amount"])?;
    if amount_cents < 0 {
        return Err(CoreError::validation(
            "cashDelta amount must be a non-negative magnitude",
        ));
    }

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        auth::ensure_shop_scope(actor, &pkg.shop_id)?;

        if pkg.status != PackageStatus::Delivered {
            return Err(CoreError::validation(
                "Exchange is only legal for a delivered package",
            ));
        }

        let replaced = pkg.exchange_details.is_some();
        let now = Utc::now().to_rfc3339();
        let details = serde_json::json!({
            "takeItems": take_items,
            "giveItems": give_items,
            "cashDelta": {
                "direction": direction,
                "amount": money::major_from_cents(amount_cents),
            },
            "requestedAt": now,
        });

        conn.execute(
            "UPDATE packages SET exchange_details = ?1, updated_at = ?2 WHERE id = ?3",
            params![details.to_string(), now, package_id],
        )
        .map_err(|e| CoreError::Db(format!("record exchange: {e}")))?;

        let signed_delta = if direction == "give" {
            -amount_cents
        } else {
            amount_cents
        };
        ledger::on_return_or_exchange(
            &conn,
            &pkg.shop_id,
            &pkg.id,
            signed_delta,
            "Exchange cash delta",
        )?;

        if amount_cents > 0 {
            events::record_event(
                &conn,
                "shop.ledgerAdjusted",
                &pkg.shop_id,
                &serde_json::json!({
                    "operation": "exchange",
                    "packageId": pkg.id,
                    "direction": direction,
                    "amount": money::major_from_cents(amount_cents),
                }),
            )?;
        }

        Ok(serde_json::json!({
            "success": true,
            "packageId": pkg.id,
            "exchangeDetails": details,
            "replacedPendingExchange": replaced,
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, "Exchange recorded");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment;
    use crate::db;
    use crate::ledger::replay_balances;
    use crate::packages::create_package;
    use crate::transitions::update_status;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    /// Deliver a package with items [qty 3, qty 2] and COD 100.
    /// Returns (package_id, [item1_id, item2_id]).
    fn delivered_package(db: &DbState) -> (String, Vec<String>) {
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO shops (id, business_name, created_at, updated_at)
                 VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO drivers (id, name, vehicle_type, created_at, updated_at)
                 VALUES ('drv-1', 'Test Driver', 'car', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }
        let r = create_package(
            db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "description": "Two shirts",
                "codAmount": 100.0,
                "schedulePickupTime": "2026-08-08T09:00:00+00:00",
                "items": [
                    { "description": "Shirt A", "quantity": 3, "codAmount": 60.0 },
                    { "description": "Shirt B", "quantity": 2, "codAmount": 40.0 },
                ],
            }),
        )
        .unwrap();
        let package_id = r["id"].as_str().unwrap().to_string();

        assignment::assign_package(
            db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap();
        let driver = Actor::Driver("drv-1".into());
        for status in ["pickedup", "in-transit", "delivered"] {
            update_status(
                db,
                &driver,
                &serde_json::json!({ "packageId": package_id, "status": status }),
            )
            .unwrap();
        }

        let item_ids: Vec<String> = {
            let conn = db.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM items WHERE package_id = ?1 ORDER BY created_at ASC, id ASC",
                )
                .unwrap();
            stmt.query_map(params![package_id], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        (package_id, item_ids)
    }

    fn total_collected(db: &DbState) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT total_collected_cents FROM shops WHERE id = 'shop-1'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_over_return_rejected() {
        let db = test_db();
        let (package_id, items) = delivered_package(&db);

        // Items are [qty 3, qty 2]; asking 4 of item 1 exceeds delivery.
        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": items[0], "quantity": 4 }],
                "refundAmount": 10.0,
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OverReturn");

        // Atomic rejection: nothing was recorded, no money moved.
        assert_eq!(total_collected(&db), 10000);
        let conn = db.conn.lock().unwrap();
        let details: Option<String> = conn
            .query_row(
                "SELECT return_details FROM packages WHERE id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(details.is_none());
    }

    #[test]
    fn test_partial_returns_accumulate_until_exhausted() {
        let db = test_db();
        let (package_id, items) = delivered_package(&db);
        let shop = Actor::Shop("shop-1".into());

        // First partial return: 2 of item 1, refund 40.
        let r = request_return(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": items[0], "quantity": 2 }],
                "refundAmount": 40.0,
            }),
        )
        .unwrap();
        assert_eq!(r["totalRefunded"], 40.0);
        assert_eq!(total_collected(&db), 6000);

        // 2 more of item 1 would exceed the remaining 1.
        let err = request_return(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": items[0], "quantity": 2 }],
                "refundAmount": 10.0,
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OverReturn");

        // The exact remainder passes: 1 of item 1 plus both of item 2.
        request_return(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "items": [
                    { "itemId": items[0], "quantity": 1 },
                    { "itemId": items[1], "quantity": 2 },
                ],
                "refundAmount": 60.0,
            }),
        )
        .unwrap();
        assert_eq!(total_collected(&db), 0);

        // Everything is back with the shop now.
        let err = request_return(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": items[1], "quantity": 1 }],
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OverReturn");

        // Ledger log still replays to the cached balances.
        let audit = replay_balances(&db, "shop-1").unwrap();
        assert_eq!(audit["matches"], true, "replay drift: {audit}");
    }

    #[test]
    fn test_refund_exceeding_collected_balance_is_atomic() {
        let db = test_db();
        let (package_id, items) = delivered_package(&db);

        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": items[0], "quantity": 1 }],
                "refundAmount": 150.0,
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "InsufficientBalance");

        // The quantity record rolled back with the money rejection.
        let conn = db.conn.lock().unwrap();
        let details: Option<String> = conn
            .query_row(
                "SELECT return_details FROM packages WHERE id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(details.is_none(), "rejected return must not persist");
        drop(conn);
        assert_eq!(total_collected(&db), 10000);
    }

    #[test]
    fn test_return_requires_delivered_status_and_items() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO shops (id, business_name, created_at, updated_at)
                 VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }
        let r = create_package(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({ "description": "Box" }),
        )
        .unwrap();
        let package_id = r["id"].as_str().unwrap();

        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": "whatever", "quantity": 1 }],
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidTransition");

        // Empty or malformed item lists never pass validation.
        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({ "packageId": package_id, "items": [] }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": "x", "quantity": 0 }],
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_return_respects_partial_delivery_snapshot() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO shops (id, business_name, created_at, updated_at)
                 VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO drivers (id, name, vehicle_type, created_at, updated_at)
                 VALUES ('drv-1', 'Test Driver', 'car', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }
        let r = create_package(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "description": "Partial",
                "codAmount": 30.0,
                "schedulePickupTime": "2026-08-08T09:00:00+00:00",
                "items": [{ "description": "Mug", "quantity": 3, "codAmount": 30.0 }],
            }),
        )
        .unwrap();
        let package_id = r["id"].as_str().unwrap().to_string();
        assignment::assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap();
        let driver = Actor::Driver("drv-1".into());
        update_status(
            &db,
            &driver,
            &serde_json::json!({ "packageId": package_id, "status": "pickedup" }),
        )
        .unwrap();
        update_status(
            &db,
            &driver,
            &serde_json::json!({ "packageId": package_id, "status": "in-transit" }),
        )
        .unwrap();

        let item_id: String = {
            let conn = db.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM items WHERE package_id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .unwrap()
        };

        // Only 2 of 3 were delivered.
        update_status(
            &db,
            &driver,
            &serde_json::json!({
                "packageId": package_id,
                "status": "delivered",
                "deliveredItems": [{ "itemId": item_id, "deliveredQuantity": 2 }],
            }),
        )
        .unwrap();

        // Returning 3 exceeds the delivered 2, even though 3 were ordered.
        let err = request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": item_id, "quantity": 3 }],
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OverReturn");

        request_return(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({
                "packageId": package_id,
                "items": [{ "itemId": item_id, "quantity": 2 }],
            }),
        )
        .unwrap();
    }

    #[test]
    fn test_exchange_adjusts_ledger_by_direction() {
        let db = test_db();
        let (package_id, _) = delivered_package(&db);
        let shop = Actor::Shop("shop-1".into());

        // Platform owes the customer 20: collected balance drops.
        request_exchange(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "takeItems": [{ "description": "Shirt A", "quantity": 1 }],
                "giveItems": [{ "description": "Shirt A (L)", "quantity": 1 }],
                "cashDelta": { "direction": "give", "amount": 20.0 },
            }),
        )
        .unwrap();
        assert_eq!(total_collected(&db), 8000);

        // A replacement request with a take delta: customer owes 5 more.
        let r = request_exchange(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "takeItems": [],
                "giveItems": [{ "description": "Upgrade", "quantity": 1 }],
                "cashDelta": { "direction": "take", "amount": 5.0 },
            }),
        )
        .unwrap();
        assert_eq!(r["replacedPendingExchange"], true);
        assert_eq!(total_collected(&db), 8500);

        // Only the latest exchange is on file.
        let conn = db.conn.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT exchange_details FROM packages WHERE id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .unwrap();
        let details: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(details["cashDelta"]["direction"], "take");
        assert_eq!(details["cashDelta"]["amount"], 5.0);
        drop(conn);

        let audit = replay_balances(&db, "shop-1").unwrap();
        assert_eq!(audit["matches"], true);
    }

    #[test]
    fn test_exchange_validation() {
        let db = test_db();
        let (package_id, _) = delivered_package(&db);
        let shop = Actor::Shop("shop-1".into());

        // Missing direction.
        let err = request_exchange(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "cashDelta": { "amount": 5.0 },
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        // Negative magnitude.
        let err = request_exchange(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "cashDelta": { "direction": "give", "amount": -5.0 },
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        // Zero delta is legal and produces no money transaction.
        let before: i64 = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM money_transactions", [], |row| {
                row.get(0)
            })
            .unwrap()
        };
        request_exchange(
            &db,
            &shop,
            &serde_json::json!({
                "packageId": package_id,
                "giveItems": [{ "description": "Swap", "quantity": 1 }],
                "cashDelta": { "direction": "give", "amount": 0.0 },
            }),
        )
        .unwrap();
        let after: i64 = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM money_transactions", [], |row| {
                row.get(0)
            })
            .unwrap()
        };
        assert_eq!(before, after);

        // Another shop cannot touch this package.
        let err = request_exchange(
            &db,
            &Actor::Shop("shop-2".into()),
            &serde_json::json!({
                "packageId": package_id,
                "cashDelta": { "direction": "give", "amount": 1.0 },
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OwnershipViolation");
    }
}
