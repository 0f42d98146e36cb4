//! Driver-to-package assignment tracking.
//!
//! Assignments are an append-only history: every handoff appends a row to
//! `package_assignments`, and closing rows (delivered, cancelled, rejected,
//! reassigned) never deletes them, so a package rejected and handed to
//! another driver keeps its full trail. Per-driver counters are derived
//! aggregates over this history, never independently mutable state.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::packages::PackageRow;
use crate::status::PackageStatus;
use crate::transitions;
use crate::value_str;

// ---------------------------------------------------------------------------
// Assign
// ---------------------------------------------------------------------------

fn driver_available(conn: &Connection, driver_id: &str) -> CoreResult<bool> {
    conn.query_row(
        "SELECT is_available FROM drivers WHERE id = ?1",
        params![driver_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(|e| CoreError::Db(e.to_string()))?
    .map(|v| v != 0)
    .ok_or_else(|| CoreError::NotFound(format!("Driver {driver_id}")))
}

/// Assign an available driver to a pending package.
pub fn assign_package(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let driver_id = value_str(payload, &["driverId", "driver_id"])
        .ok_or_else(|| CoreError::validation("Missing driverId"))?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        if !driver_available(&conn, &driver_id)? {
            return Err(CoreError::validation(format!(
                "Driver {driver_id} is not available"
            )));
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE packages SET driver_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![driver_id, now, package_id],
        )
        .map_err(|e| CoreError::Db(format!("set driver: {e}")))?;
        conn.execute(
            "INSERT INTO package_assignments (package_id, driver_id, assigned_at)
             VALUES (?1, ?2, ?3)",
            params![package_id, driver_id, now],
        )
        .map_err(|e| CoreError::Db(format!("insert assignment: {e}")))?;

        let note = format!("Assigned to driver {driver_id}");
        transitions::apply_transition(&conn, &pkg, PackageStatus::Assigned, Some(&note), None)
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, driver_id = %driver_id, "Driver assigned");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Bulk-assign one driver to many packages.
///
/// Each package is processed in its own transaction: a failure on one is
/// reported and never rolls back or blocks the already-committed ones.
pub fn assign_packages(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let driver_id = value_str(payload, &["driverId", "driver_id"])
        .ok_or_else(|| CoreError::validation("Missing driverId"))?;
    let package_ids = payload
        .get("packageIds")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| CoreError::validation("No packageIds provided"))?;

    let mut assigned = Vec::new();
    let mut failed = Vec::new();

    for entry in package_ids {
        let Some(package_id) = entry.as_str() else {
            failed.push(serde_json::json!({
                "packageId": entry,
                "error": "packageIds entries must be strings",
                "kind": "ValidationError",
            }));
            continue;
        };
        let item = serde_json::json!({ "packageId": package_id, "driverId": driver_id });
        match assign_package(db, actor, &item) {
            Ok(_) => assigned.push(package_id.to_string()),
            Err(e) => {
                warn!(package_id = %package_id, error = %e, "Bulk assign entry failed");
                failed.push(serde_json::json!({
                    "packageId": package_id,
                    "error": e.to_string(),
                    "kind": e.kind(),
                }));
            }
        }
    }

    Ok(serde_json::json!({
        "success": failed.is_empty(),
        "driverId": driver_id,
        "assigned": assigned,
        "failed": failed,
    }))
}

/// Swap the driver on a not-yet-picked-up package.
///
/// The prior assignment row is closed with a `reassigned` outcome and a
/// new row appended; the package status stays `assigned`, so the status
/// history records no illegal edge.
pub fn reassign_package(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let driver_id = value_str(payload, &["driverId", "driver_id"])
        .ok_or_else(|| CoreError::validation("Missing driverId"))?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let pkg = PackageRow::load(&conn, &package_id)?;
        if pkg.status != PackageStatus::Assigned {
            return Err(CoreError::validation(format!(
                "Only packages in 'assigned' can be reassigned (current: {})",
                pkg.status.as_str()
            )));
        }
        if pkg.driver_id.as_deref() == Some(driver_id.as_str()) {
            return Err(CoreError::validation(
                "Package is already assigned to this driver",
            ));
        }
        if !driver_available(&conn, &driver_id)? {
            return Err(CoreError::validation(format!(
                "Driver {driver_id} is not available"
            )));
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE package_assignments SET released_at = ?1, outcome = 'reassigned'
             WHERE package_id = ?2 AND released_at IS NULL",
            params![now, package_id],
        )
        .map_err(|e| CoreError::Db(format!("close assignment: {e}")))?;
        conn.execute(
            "UPDATE packages SET driver_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![driver_id, now, package_id],
        )
        .map_err(|e| CoreError::Db(format!("set driver: {e}")))?;
        conn.execute(
            "INSERT INTO package_assignments (package_id, driver_id, assigned_at)
             VALUES (?1, ?2, ?3)",
            params![package_id, driver_id, now],
        )
        .map_err(|e| CoreError::Db(format!("insert assignment: {e}")))?;

        Ok(serde_json::json!({
            "success": true,
            "packageId": package_id,
            "previousDriverId": pkg.driver_id,
            "driverId": driver_id,
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(package_id = %package_id, driver_id = %driver_id, "Driver reassigned");
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Derived counters
// ---------------------------------------------------------------------------

/// Per-driver counters, computed from the assignment history on demand.
pub fn driver_stats(db: &DbState, actor: &Actor, driver_id: &str) -> CoreResult<Value> {
    match actor {
        Actor::Admin => {}
        Actor::Driver(id) if id == driver_id => {}
        _ => return Err(CoreError::OwnershipViolation),
    }

    let conn = db.lock()?;

    // Driver must exist.
    driver_available(&conn, driver_id)?;

    let (total_assigned, total_deliveries, total_cancelled, active_assign, assigned_today): (
        i64,
        i64,
        i64,
        i64,
        i64,
    ) = conn
        .query_row(
            "SELECT
                COUNT(*),
                COUNT(CASE WHEN outcome = 'delivered' THEN 1 END),
                COUNT(CASE WHEN outcome IN ('cancelled', 'rejected') THEN 1 END),
                COUNT(CASE WHEN released_at IS NULL THEN 1 END),
                COUNT(CASE WHEN date(assigned_at) = date('now') THEN 1 END)
             FROM package_assignments
             WHERE driver_id = ?1",
            params![driver_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;

    Ok(serde_json::json!({
        "driverId": driver_id,
        "totalAssigned": total_assigned,
        "totalDeliveries": total_deliveries,
        "totalCancelled": total_cancelled,
        "activeAssign": active_assign,
        "assignedToday": assigned_today,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::packages::create_package;
    use crate::transitions::{reject_package, update_status};
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

    fn seed_shop(db: &DbState, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES (?1, 'Test Shop', datetime('now'), datetime('now'))",
            params![id],
        )
        .expect("insert shop");
    }

    fn seed_driver(db: &DbState, id: &str, available: bool) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO drivers (id, name, vehicle_type, is_available, created_at, updated_at)
             VALUES (?1, 'Test Driver', 'van', ?2, datetime('now'), datetime('now'))",
            params![id, available as i64],
        )
        .expect("insert driver");
    }

    fn pending_package(db: &DbState, shop: &str) -> String {
        create_package(
            db,
            &Actor::Shop(shop.to_string()),
            &serde_json::json!({
                "description": "Box",
                "schedulePickupTime": "2026-08-08T09:00:00+00:00",
            }),
        )
        .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_assign_package_moves_to_assigned() {
        let db = test_db();
        seed_shop(&db, "shop-1");
        seed_driver(&db, "drv-1", true);
        let package_id = pending_package(&db, "shop-1");

        let r = assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap();
        assert_eq!(r["to"], "assigned");

        // Assigning an already-assigned package is an invalid transition.
        let err = assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidTransition");
    }

    #[test]
    fn test_assign_requires_available_driver_and_admin() {
        let db = test_db();
        seed_shop(&db, "shop-1");
        seed_driver(&db, "drv-off", false);
        let package_id = pending_package(&db, "shop-1");

        let err = assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-off" }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        let err = assign_package(
            &db,
            &Actor::Shop("shop-1".into()),
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-off" }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OwnershipViolation");

        let err = assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-missing" }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn test_bulk_assign_partial_failure_keeps_successes() {
        let db = test_db();
        seed_shop(&db, "shop-1");
        seed_driver(&db, "drv-1", true);
        let p1 = pending_package(&db, "shop-1");
        let p2 = pending_package(&db, "shop-1");

        // p2 is already delivered-bound: make it fail by pre-assigning.
        assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": p2, "driverId": "drv-1" }),
        )
        .unwrap();

        let r = assign_packages(
            &db,
            &Actor::Admin,
            &serde_json::json!({
                "driverId": "drv-1",
                "packageIds": [p1, p2, "missing-id"],
            }),
        )
        .unwrap();

        let assigned = r["assigned"].as_array().unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0], p1.as_str());

        let failed = r["failed"].as_array().unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0]["packageId"], p2.as_str());
        assert_eq!(failed[0]["kind"], "InvalidTransition");
        assert_eq!(failed[1]["kind"], "NotFound");

        // The success stayed committed despite later failures.
        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM packages WHERE id = ?1",
                params![p1],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "assigned");
    }

    #[test]
    fn test_reassign_keeps_full_history() {
        let db = test_db();
        seed_shop(&db, "shop-1");
        seed_driver(&db, "drv-1", true);
        seed_driver(&db, "drv-2", true);
        let package_id = pending_package(&db, "shop-1");

        assign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap();
        let r = reassign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-2" }),
        )
        .unwrap();
        assert_eq!(r["previousDriverId"], "drv-1");

        let conn = db.conn.lock().unwrap();
        let rows: Vec<(String, Option<String>)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT driver_id, outcome FROM package_assignments
                     WHERE package_id = ?1 ORDER BY id ASC",
                )
                .unwrap();
            stmt.query_map(params![package_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("drv-1".to_string(), Some("reassigned".to_string())));
        assert_eq!(rows[1], ("drv-2".to_string(), None));

        // Once picked up, reassignment is no longer possible.
        drop(conn);
        update_status(
            &db,
            &Actor::Driver("drv-2".into()),
            &serde_json::json!({ "packageId": package_id, "status": "pickedup" }),
        )
        .unwrap();
        let err = reassign_package(
            &db,
            &Actor::Admin,
            &serde_json::json!({ "packageId": package_id, "driverId": "drv-1" }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_driver_stats_are_derived_from_history() {
        let db = test_db();
        seed_shop(&db, "shop-1");
        seed_driver(&db, "drv-1", true);

        // One delivered, one rejected, one still active.
        let delivered = pending_package(&db, "shop-1");
        let rejected = pending_package(&db, "shop-1");
        let active = pending_package(&db, "shop-1");
        for p in [&delivered, &rejected, &active] {
            assign_package(
                &db,
                &Actor::Admin,
                &serde_json::json!({ "packageId": p, "driverId": "drv-1" }),
            )
            .unwrap();
        }
        let driver = Actor::Driver("drv-1".into());
        for status in ["pickedup", "in-transit", "delivered"] {
            update_status(
                &db,
                &driver,
                &serde_json::json!({ "packageId": delivered, "status": status }),
            )
            .unwrap();
        }
        reject_package(&db, &driver, &serde_json::json!({ "packageId": rejected })).unwrap();

        let stats = driver_stats(&db, &driver, "drv-1").unwrap();
        assert_eq!(stats["totalAssigned"], 3);
        assert_eq!(stats["totalDeliveries"], 1);
        assert_eq!(stats["totalCancelled"], 1);
        assert_eq!(stats["activeAssign"], 1);
        assert_eq!(stats["assignedToday"], 3);

        // Another driver cannot read these stats.
        let err = driver_stats(&db, &Actor::Driver("drv-2".into()), "drv-1").unwrap_err();
        assert_eq!(err.kind(), "OwnershipViolation");
    }
}
