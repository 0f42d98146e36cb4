//! Pickup batches: grouping packages for collection from a shop.
//!
//! Scheduling a batch moves its packages `awaiting_schedule ->
//! scheduled_for_pickup`; marking the batch picked up moves them to
//! `pending` (visible to the driver pool). A cancelled batch detaches its
//! packages so they can be re-batched; their recorded history is never
//! rewritten.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::packages::PackageRow;
use crate::status::PackageStatus;
use crate::transitions;
use crate::value_str;

fn load_pickup(conn: &Connection, pickup_id: &str) -> CoreResult<(String, String)> {
    conn.query_row(
        "SELECT shop_id, status FROM pickups WHERE id = ?1",
        params![pickup_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| CoreError::Db(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("Pickup {pickup_id}")))
}

/// Create a pickup batch over a shop's unscheduled packages.
///
/// The batch is one physical collection trip, so it commits as a single
/// unit: either every listed package is scheduled or none is.
pub fn create_pickup(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let shop_id = match actor {
        Actor::Shop(id) => id.clone(),
        Actor::Admin => value_str(payload, &["shopId", "shop_id"])
            .ok_or_else(|| CoreError::validation("Missing shopId"))?,
        Actor::Driver(_) => return Err(CoreError::OwnershipViolation),
    };
    let scheduled_time = value_str(payload, &["scheduledTime", "scheduled_time"])
        .ok_or_else(|| CoreError::validation("Missing scheduledTime"))?;
    let pickup_address = value_str(payload, &["pickupAddress", "pickup_address"]);
    let package_ids: Vec<String> = payload
        .get("packageIds")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| CoreError::validation("No packageIds provided"))?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if package_ids.is_empty() {
        return Err(CoreError::validation("packageIds entries must be strings"));
    }

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pickup_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO pickups (id, shop_id, scheduled_time, pickup_address, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)",
            params![pickup_id, shop_id, scheduled_time, pickup_address, now],
        )
        .map_err(|e| CoreError::Db(format!("insert pickup: {e}")))?;

        for package_id in &package_ids {
            let pkg = PackageRow::load(&conn, package_id)?;
            if pkg.shop_id != shop_id {
                return Err(CoreError::OwnershipViolation);
            }
            match pkg.status {
                PackageStatus::AwaitingSchedule => {
                    transitions::apply_transition(
                        &conn,
                        &pkg,
                        PackageStatus::ScheduledForPickup,
                        Some("Pickup scheduled"),
                        None,
                    )?;
                }
                // A package left behind by a cancelled batch keeps its
                // scheduled status and just joins the new batch.
                PackageStatus::ScheduledForPickup => {
                    let attached: Option<String> = conn
                        .query_row(
                            "SELECT pickup_id FROM packages WHERE id = ?1",
                            params![package_id],
                            |row| row.get(0),
                        )
                        .map_err(|e| CoreError::Db(e.to_string()))?;
                    if attached.is_some() {
                        return Err(CoreError::validation(format!(
                            "Package {package_id} is already in a pickup batch"
                        )));
                    }
                }
                other => {
                    return Err(CoreError::InvalidTransition {
                        from: other.as_str().to_string(),
                        to: PackageStatus::ScheduledForPickup.as_str().to_string(),
                    })
                }
            }
            conn.execute(
                "UPDATE packages SET pickup_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![pickup_id, now, package_id],
            )
            .map_err(|e| CoreError::Db(format!("attach package: {e}")))?;
        }

        Ok(serde_json::json!({
            "success": true,
            "pickupId": pickup_id,
            "shopId": shop_id,
            "packageCount": package_ids.len(),
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                pickup_id = %v["pickupId"].as_str().unwrap_or(""),
                packages = package_ids.len(),
                "Pickup scheduled"
            );
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Mark a pickup batch as collected; its packages enter the driver pool.
pub fn mark_picked_up(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let pickup_id = value_str(payload, &["pickupId", "pickup_id"])
        .ok_or_else(|| CoreError::validation("Missing pickupId"))?;
    let driver_id = value_str(payload, &["driverId", "driver_id"]);

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let (_, status) = load_pickup(&conn, &pickup_id)?;
        if status != "open" {
            return Err(CoreError::validation(format!(
                "Pickup is {status}, not open"
            )));
        }

        let package_ids: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM packages WHERE pickup_id = ?1")
                .map_err(|e| CoreError::Db(e.to_string()))?;
            let ids: Vec<String> = stmt
                .query_map(params![pickup_id], |row| row.get(0))
                .map_err(|e| CoreError::Db(e.to_string()))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        for package_id in &package_ids {
            let pkg = PackageRow::load(&conn, package_id)?;
            transitions::apply_transition(
                &conn,
                &pkg,
                PackageStatus::Pending,
                Some("Collected from shop"),
                None,
            )?;
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE pickups SET status = 'picked_up', driver_id = ?1,
                actual_pickup_time = ?2, updated_at = ?2
             WHERE id = ?3",
            params![driver_id, now, pickup_id],
        )
        .map_err(|e| CoreError::Db(format!("update pickup: {e}")))?;

        Ok(serde_json::json!({
            "success": true,
            "pickupId": pickup_id,
            "packageCount": package_ids.len(),
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(pickup_id = %pickup_id, "Pickup collected");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Cancel an open pickup batch, detaching its packages for re-batching.
pub fn cancel_pickup(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let pickup_id = value_str(payload, &["pickupId", "pickup_id"])
        .ok_or_else(|| CoreError::validation("Missing pickupId"))?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let (shop_id, status) = load_pickup(&conn, &pickup_id)?;
        auth::ensure_shop_scope(actor, &shop_id)?;
        if status != "open" {
            return Err(CoreError::validation(format!(
                "Pickup is {status}, not open"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let detached = conn
            .execute(
                "UPDATE packages SET pickup_id = NULL, updated_at = ?1 WHERE pickup_id = ?2",
                params![now, pickup_id],
            )
            .map_err(|e| CoreError::Db(format!("detach packages: {e}")))?;
        conn.execute(
            "UPDATE pickups SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
            params![now, pickup_id],
        )
        .map_err(|e| CoreError::Db(format!("cancel pickup: {e}")))?;

        Ok(serde_json::json!({
            "success": true,
            "pickupId": pickup_id,
            "detachedPackages": detached,
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(pickup_id = %pickup_id, "Pickup cancelled");
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
