//! Package status transition engine.
//!
//! Every status change runs through [`apply_transition`] inside one
//! `BEGIN IMMEDIATE` transaction: registry validation, the append-only
//! status history record, ledger hooks, the delivered-items snapshot,
//! assignment closure, and event emission all commit together or not at
//! all.
//!
//! **Rules:**
//! - A shop may only cancel its own packages; a driver may only advance
//!   packages currently assigned to them; admins may do anything
//! - Entering `delivered` fixes `delivered_items` (full item set unless a
//!   recorded value is explicitly supplied) and credits the shop ledger
//! - Entering any `cancelled*`/`rejected*` state closes the active driver
//!   assignment; the terminal `*-returned` hop is a plain status move

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::events;
use crate::ledger;
use crate::money;
use crate::packages::{self, PackageRow};
use crate::status::{self, PackageStatus};
use crate::value_str;

// ---------------------------------------------------------------------------
// Core engine
// ---------------------------------------------------------------------------

/// Apply one validated transition with all its side effects.
///
/// Runs inside the caller's transaction; the caller has already done the
/// ownership check.
pub(crate) fn apply_transition(
    conn: &Connection,
    pkg: &PackageRow,
    next: PackageStatus,
    note: Option<&str>,
    delivered_items: Option<&Value>,
) -> CoreResult<Value> {
    status::ensure_transition(pkg.status, next)?;

    let now = packages::write_status(conn, pkg, next, note)?;

    match next {
        PackageStatus::Pickedup => {
            conn.execute(
                "UPDATE packages SET picked_up_at = ?1 WHERE id = ?2",
                params![now, pkg.id],
            )
            .map_err(|e| CoreError::Db(format!("set picked_up_at: {e}")))?;
        }
        PackageStatus::Delivered => {
            let snapshot = delivered_items_snapshot(conn, pkg, delivered_items)?;
            conn.execute(
                "UPDATE packages SET delivered_at = ?1, delivered_items = ?2 WHERE id = ?3",
                params![now, snapshot.to_string(), pkg.id],
            )
            .map_err(|e| CoreError::Db(format!("set delivered fields: {e}")))?;

            ledger::on_delivered(conn, &pkg.shop_id, &pkg.id, pkg.cod_amount_cents)?;
            close_active_assignment(conn, &pkg.id, "delivered", &now)?;

            events::record_event(
                conn,
                "package.delivered",
                &pkg.id,
                &serde_json::json!({
                    "trackingNumber": pkg.tracking_number,
                    "shopId": pkg.shop_id,
                    "codAmount": money::major_from_cents(pkg.cod_amount_cents),
                }),
            )?;
        }
        _ if next.is_cancel_entry() => {
            ledger::on_cancelled(conn, &pkg.shop_id, &pkg.id, false)?;
            close_active_assignment(conn, &pkg.id, "cancelled", &now)?;
        }
        _ if next.is_reject_entry() => {
            ledger::on_cancelled(conn, &pkg.shop_id, &pkg.id, true)?;
            close_active_assignment(conn, &pkg.id, "rejected", &now)?;
        }
        _ => {}
    }

    events::record_event(
        conn,
        "package.statusChanged",
        &pkg.id,
        &serde_json::json!({
            "trackingNumber": pkg.tracking_number,
            "from": pkg.status.as_str(),
            "to": next.as_str(),
            "note": note,
        }),
    )?;

    Ok(serde_json::json!({
        "success": true,
        "packageId": pkg.id,
        "trackingNumber": pkg.tracking_number,
        "from": pkg.status.as_str(),
        "to": next.as_str(),
    }))
}

/// Freeze the delivered item quantities at the moment of delivery.
///
/// With no explicit value the full item set is assumed delivered. An
/// explicit list must reference existing items and stay within their
/// original quantities.
fn delivered_items_snapshot(
    conn: &Connection,
    pkg: &PackageRow,
    explicit: Option<&Value>,
) -> CoreResult<Value> {
    let mut stmt = conn
        .prepare("SELECT id, quantity FROM items WHERE package_id = ?1 ORDER BY created_at ASC, id ASC")
        .map_err(|e| CoreError::Db(e.to_string()))?;
    let items: Vec<(String, i64)> = stmt
        .query_map(params![pkg.id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| CoreError::Db(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    let Some(requested) = explicit.and_then(Value::as_array) else {
        let full: Vec<Value> = items
            .iter()
            .map(|(id, qty)| {
                serde_json::json!({ "itemId": id, "deliveredQuantity": qty })
            })
            .collect();
        return Ok(Value::Array(full));
    };

    let mut snapshot = Vec::with_capacity(requested.len());
    for entry in requested {
        let item_id = value_str(entry, &["itemId", "item_id"])
            .ok_or_else(|| CoreError::validation("Delivered item entry missing itemId"))?;
        let delivered = entry
            .get("deliveredQuantity")
            .or_else(|| entry.get("quantity"))
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::validation("Delivered item entry missing quantity"))?;
        let Some((_, original)) = items.iter().find(|(id, _)| *id == item_id) else {
            return Err(CoreError::validation(format!(
                "Unknown item in delivered list: {item_id}"
            )));
        };
        if delivered < 0 || delivered > *original {
            return Err(CoreError::validation(format!(
                "Delivered quantity {delivered} out of range for item {item_id}"
            )));
        }
        snapshot.push(serde_json::json!({
            "itemId": item_id,
            "deliveredQuantity": delivered,
        }));
    }
    Ok(Value::Array(snapshot))
}

/// Close the open assignment row, if any, recording how it ended.
fn close_active_assignment(
    conn: &Connection,
    package_id: &str,
    outcome: &str,
    now: &str,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE package_assignments SET released_at = ?1, outcome = ?2
         WHERE package_id = ?3 AND released_at IS NULL",
        params![now, outcome, package_id],
    )
    .map_err(|e| CoreError::Db(format!("close assignment: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Statuses a driver may request directly for a package assigned to them.
const DRIVER_TARGETS: &[PackageStatus] = &[
    PackageStatus::Pickedup,
    PackageStatus::InTransit,
    PackageStatus::Delivered,
];

/// Drive the state machine with an explicitly requested next status.
pub fn update_status(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let requested = PackageStatus::parse(
        &value_str(payload, &["status"]).ok_or_else(|| CoreError::validation("Missing status"))?,
    )?;
    let note = value_str(payload, &["note"]);

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;

        match actor {
            Actor::Admin => {}
            Actor::Driver(_) => {
                auth::ensure_assigned_driver(actor, pkg.driver_id.as_deref())?;
                if !DRIVER_TARGETS.contains(&requested) {
                    return Err(CoreError::OwnershipViolation);
                }
            }
            // Shops never drive the main chain directly; they cancel or
            // request returns/exchanges through the dedicated operations.
            Actor::Shop(_) => return Err(CoreError::OwnershipViolation),
        }

        apply_transition(
            &conn,
            &pkg,
            requested,
            note.as_deref(),
            payload.get("deliveredItems"),
        )
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                package_id = %package_id,
                from = %v["from"].as_str().unwrap_or(""),
                to = %v["to"].as_str().unwrap_or(""),
                "Package status updated"
            );
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Cancel a package (shop- or operator-initiated).
///
/// Before pickup the package terminates in `cancelled`; after pickup it
/// must come back first, so it moves to `cancelled-awaiting-return`.
pub fn cancel_package(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let note = value_str(payload, &["note", "reason"]);

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        auth::ensure_shop_scope(actor, &pkg.shop_id)?;

        let had_pickup = pkg.had_pickup();
        let target = status::cancel_target(pkg.status, had_pickup)?;
        apply_transition(&conn, &pkg, target, note.as_deref(), None)
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, to = %v["to"].as_str().unwrap_or(""), "Package cancelled");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Reject a package mid-flight (driver- or operator-initiated).
pub fn reject_package(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let note = value_str(payload, &["note", "reason"]);

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        auth::ensure_assigned_driver(actor, pkg.driver_id.as_deref())?;

        let had_pickup = pkg.had_pickup();
        let target = status::reject_target(pkg.status, had_pickup)?;
        apply_transition(&conn, &pkg, target, note.as_deref(), None)
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, to = %v["to"].as_str().unwrap_or(""), "Package rejected");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Operator confirms the physical return of a cancelled/rejected package.
pub fn mark_returned(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id", "id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let note = value_str(payload, &["note"]);

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        let target = match pkg.status {
            PackageStatus::CancelledAwaitingReturn => PackageStatus::CancelledReturned,
            PackageStatus::RejectedAwaitingReturn => PackageStatus::RejectedReturned,
            other => {
                return Err(CoreError::InvalidTransition {
                    from: other.as_str().to_string(),
                    to: PackageStatus::CancelledReturned.as_str().to_string(),
                })
            }
        };
        apply_transition(&conn, &pkg, target, note.as_deref(), None)
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, to = %v["to"].as_str().unwrap_or(""), "Package return confirmed");
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
