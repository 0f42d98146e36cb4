//! Package records and their financial fields.
//!
//! A package is exclusively owned by one shop, carries the COD amount to
//! collect from the recipient plus the delivery fee charged to the shop,
//! and accumulates an append-only status history and notes log. Packages
//! are never deleted except through the explicit shop cascade in
//! [`crate::shops`].
//!
//! **Rules:**
//! - `shown_delivery_cost` may never exceed `delivery_cost`
//! - For manually created packages the item COD breakdown must sum to the
//!   package COD amount; imported orders may diverge (their COD embeds the
//!   delivery fee)
//! - Notes and status history are append-only, never edited or reordered

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::money;
use crate::status::PackageStatus;
use crate::value_str;

// ---------------------------------------------------------------------------
// Row snapshot
// ---------------------------------------------------------------------------

/// In-memory snapshot of the package columns the core operates on.
#[derive(Debug)]
pub(crate) struct PackageRow {
    pub id: String,
    pub tracking_number: String,
    pub shop_id: String,
    pub driver_id: Option<String>,
    pub status: PackageStatus,
    pub status_history: Value,
    pub cod_amount_cents: i64,
    pub delivery_cost_cents: i64,
    pub shown_delivery_cost_cents: Option<i64>,
    pub delivered_items: Option<Value>,
    pub return_details: Option<Value>,
    pub return_refund_cents: i64,
    pub exchange_details: Option<Value>,
}

impl PackageRow {
    /// Load a package snapshot. Runs inside the caller's lock/transaction.
    pub(crate) fn load(conn: &Connection, package_id: &str) -> CoreResult<Self> {
        conn.query_row(
            "SELECT id, tracking_number, shop_id, driver_id, status, status_history,
                    cod_amount_cents, delivery_cost_cents, shown_delivery_cost_cents,
                    delivered_items, return_details, return_refund_cents, exchange_details
             FROM packages WHERE id = ?1",
            params![package_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, Option<String>>(12)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CoreError::Db(e.to_string()))?
        .ok_or_else(|| CoreError::NotFound(format!("Package {package_id}")))
        .and_then(|row| {
            let status = PackageStatus::parse(&row.4)?;
            Ok(PackageRow {
                id: row.0,
                tracking_number: row.1,
                shop_id: row.2,
                driver_id: row.3,
                status,
                status_history: serde_json::from_str(&row.5).unwrap_or_else(|_| Value::Array(vec![])),
                cod_amount_cents: row.6,
                delivery_cost_cents: row.7,
                shown_delivery_cost_cents: row.8,
                delivered_items: parse_json_column(row.9),
                return_details: parse_json_column(row.10),
                return_refund_cents: row.11,
                exchange_details: parse_json_column(row.12),
            })
        })
    }

    /// Whether the package ever left the shop with a driver, judged from
    /// the recorded history (used for back-dated branch decisions).
    pub(crate) fn had_pickup(&self) -> bool {
        self.status_history
            .as_array()
            .map(|entries| entries.iter().any(|e| e["status"] == "pickedup"))
            .unwrap_or(false)
    }
}

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Append a `{status, timestamp, note}` record to the package's status
/// history and update the current status. Runs inside the caller's
/// transaction; the caller has already validated the transition.
pub(crate) fn write_status(
    conn: &Connection,
    pkg: &PackageRow,
    next: PackageStatus,
    note: Option<&str>,
) -> CoreResult<String> {
    let now = Utc::now().to_rfc3339();
    let mut history = pkg
        .status_history
        .as_array()
        .cloned()
        .unwrap_or_default();
    history.push(serde_json::json!({
        "status": next.as_str(),
        "timestamp": now,
        "note": note,
    }));

    conn.execute(
        "UPDATE packages SET status = ?1, status_history = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            next.as_str(),
            Value::Array(history).to_string(),
            now,
            pkg.id
        ],
    )
    .map_err(|e| CoreError::Db(format!("update status: {e}")))?;
    Ok(now)
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Generate a customer-facing tracking code: `DP` + hex epoch seconds +
/// three digits derived from a fresh UUID.
fn generate_tracking_number() -> String {
    let timestamp = Utc::now().timestamp().max(0);
    let salt = Uuid::new_v4().as_u128() % 1000;
    format!("DP{timestamp:X}{salt:03}")
}

#[derive(Debug)]
struct ItemInput {
    description: String,
    quantity: i64,
    cod_amount_cents: i64,
}

fn parse_items(payload: &Value) -> CoreResult<Vec<ItemInput>> {
    let Some(raw) = payload.get("items") else {
        return Ok(Vec::new());
    };
    let Some(list) = raw.as_array() else {
        return Err(CoreError::validation("Field 'items' must be a list"));
    };

    let mut items = Vec::with_capacity(list.len());
    for (idx, entry) in list.iter().enumerate() {
        let description = value_str(entry, &["description"])
            .ok_or_else(|| CoreError::validation(format!("Item {idx}: missing description")))?;
        let quantity = entry
            .get("quantity")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        if quantity <= 0 {
            return Err(CoreError::validation(format!(
                "Item {idx}: quantity must be positive"
            )));
        }
        let cod_amount_cents = money::cents_field(entry, &["codAmount", "cod_amount"])?
            .unwrap_or(0);
        if cod_amount_cents < 0 {
            return Err(CoreError::validation(format!(
                "Item {idx}: COD amount must not be negative"
            )));
        }
        items.push(ItemInput {
            description,
            quantity,
            cod_amount_cents,
        });
    }
    Ok(items)
}

/// Create a package for a shop (manual creation path).
///
/// Initial state is `pending` when a pickup time is pre-scheduled, else
/// `awaiting_schedule`. A COD amount registers the money as expected on
/// the shop ledger in the same transaction.
pub fn create_package(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let shop_id = match actor {
        Actor::Shop(id) => id.clone(),
        Actor::Admin => value_str(payload, &["shopId", "shop_id"])
            .ok_or_else(|| CoreError::validation("Missing shopId"))?,
        Actor::Driver(_) => return Err(CoreError::OwnershipViolation),
    };

    let description = value_str(payload, &["description", "packageDescription"])
        .ok_or_else(|| CoreError::validation("Missing description"))?;
    let cod_amount_cents = money::cents_field(payload, &["codAmount", "cod_amount"])?.unwrap_or(0);
    if cod_amount_cents < 0 {
        return Err(CoreError::validation("COD amount must not be negative"));
    }
    let items = parse_items(payload)?;
    if !items.is_empty() {
        let item_sum: i64 = items.iter().map(|i| i.cod_amount_cents).sum();
        if item_sum != cod_amount_cents {
            return Err(CoreError::validation(format!(
                "Item COD breakdown ({}) does not sum to package COD ({})",
                money::major_from_cents(item_sum),
                money::major_from_cents(cod_amount_cents)
            )));
        }
    }

    let schedule_pickup_time = value_str(payload, &["schedulePickupTime", "schedule_pickup_time"]);
    let initial = if schedule_pickup_time.is_some() {
        PackageStatus::Pending
    } else {
        PackageStatus::AwaitingSchedule
    };

    let conn = db.lock()?;
    let defaults = shop_fee_defaults(&conn, &shop_id)?;
    let delivery_cost_cents = money::cents_field(payload, &["deliveryCost", "delivery_cost"])?
        .or(defaults.0)
        .unwrap_or(0);
    if delivery_cost_cents < 0 {
        return Err(CoreError::validation("Delivery cost must not be negative"));
    }
    let shown_delivery_cost_cents =
        money::cents_field(payload, &["shownDeliveryCost", "shown_delivery_cost"])?
            .or(defaults.1);
    if let Some(shown) = shown_delivery_cost_cents {
        if shown < 0 {
            return Err(CoreError::validation("Shown delivery cost must not be negative"));
        }
        if shown > delivery_cost_cents {
            return Err(CoreError::InconsistentFee {
                shown_cents: shown,
                cost_cents: delivery_cost_cents,
            });
        }
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        insert_package(
            &conn,
            &InsertPackage {
                shop_id: &shop_id,
                source: "manual",
                order_ref: None,
                order_name: None,
                description: &description,
                initial,
                cod_amount_cents,
                delivery_cost_cents,
                shown_delivery_cost_cents,
                schedule_pickup_time: schedule_pickup_time.as_deref(),
                delivery_contact_name: value_str(payload, &["deliveryContactName"]).as_deref(),
                delivery_contact_phone: value_str(payload, &["deliveryContactPhone"]).as_deref(),
                delivery_address: value_str(payload, &["deliveryAddress"]).as_deref(),
                items: &items,
            },
        )
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                package_id = %v["id"].as_str().unwrap_or(""),
                tracking_number = %v["trackingNumber"].as_str().unwrap_or(""),
                cod_amount = %money::major_from_cents(cod_amount_cents),
                "Package created"
            );
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Per-shop default delivery fees `(delivery_cost, shown_delivery_cost)`.
fn shop_fee_defaults(conn: &Connection, shop_id: &str) -> CoreResult<(Option<i64>, Option<i64>)> {
    conn.query_row(
        "SELECT shipping_fees_cents, shown_shipping_fees_cents FROM shops WHERE id = ?1",
        params![shop_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| CoreError::Db(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("Shop {shop_id}")))
}

struct InsertPackage<'a> {
    shop_id: &'a str,
    source: &'a str,
    order_ref: Option<&'a str>,
    order_name: Option<&'a str>,
    description: &'a str,
    initial: PackageStatus,
    cod_amount_cents: i64,
    delivery_cost_cents: i64,
    shown_delivery_cost_cents: Option<i64>,
    schedule_pickup_time: Option<&'a str>,
    delivery_contact_name: Option<&'a str>,
    delivery_contact_phone: Option<&'a str>,
    delivery_address: Option<&'a str>,
    items: &'a [ItemInput],
}

/// Insert the package row, its items, the opening history entry, and the
/// ledger registration. Runs inside the caller's transaction.
fn insert_package(conn: &Connection, input: &InsertPackage<'_>) -> CoreResult<Value> {
    let package_id = Uuid::new_v4().to_string();
    let tracking_number = generate_tracking_number();
    let now = Utc::now().to_rfc3339();
    let history = serde_json::json!([{
        "status": input.initial.as_str(),
        "timestamp": now,
        "note": "Package created",
    }]);

    conn.execute(
        "INSERT INTO packages (
            id, tracking_number, shop_id, source, order_ref, order_name,
            description, status, status_history,
            cod_amount_cents, delivery_cost_cents, shown_delivery_cost_cents,
            schedule_pickup_time, delivery_contact_name, delivery_contact_phone,
            delivery_address, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
        params![
            package_id,
            tracking_number,
            input.shop_id,
            input.source,
            input.order_ref,
            input.order_name,
            input.description,
            input.initial.as_str(),
            history.to_string(),
            input.cod_amount_cents,
            input.delivery_cost_cents,
            input.shown_delivery_cost_cents,
            input.schedule_pickup_time,
            input.delivery_contact_name,
            input.delivery_contact_phone,
            input.delivery_address,
            now,
        ],
    )
    .map_err(|e| CoreError::Db(format!("insert package: {e}")))?;

    for item in input.items {
        conn.execute(
            "INSERT INTO items (id, package_id, description, quantity, cod_amount_cents, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                package_id,
                item.description,
                item.quantity,
                item.cod_amount_cents,
                now,
            ],
        )
        .map_err(|e| CoreError::Db(format!("insert item: {e}")))?;
    }

    Ok(serde_json::json!({
        "success": true,
        "id": package_id,
        "trackingNumber": tracking_number,
        "status": input.initial.as_str(),
        "codAmount": money::major_from_cents(input.cod_amount_cents),
    }))
}

// ---------------------------------------------------------------------------
// Import bridge
// ---------------------------------------------------------------------------

/// Bulk-create packages from the storefront order bridge.
///
/// Each entry is processed in its own transaction; a failure on one order
/// never rolls back or blocks the others. Duplicate `orderRef`s for the
/// same shop are reported as already imported; the authoritative "sent"
/// record is this table, not any client-side state.
pub fn import_packages(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let shop_id = match actor {
        Actor::Shop(id) => id.clone(),
        Actor::Admin => value_str(payload, &["shopId", "shop_id"])
            .ok_or_else(|| CoreError::validation("Missing shopId"))?,
        Actor::Driver(_) => return Err(CoreError::OwnershipViolation),
    };
    let entries = payload
        .get("packages")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| CoreError::validation("No packages provided"))?;

    let mut created = Vec::new();
    let mut failed = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        match import_one(db, &shop_id, entry) {
            Ok(v) => created.push(v),
            Err(e) => {
                warn!(index, error = %e, "Import entry failed");
                failed.push(serde_json::json!({
                    "index": index,
                    "error": e.to_string(),
                    "kind": e.kind(),
                }));
            }
        }
    }

    Ok(serde_json::json!({
        "success": failed.is_empty(),
        "created": created,
        "failed": failed,
    }))
}

fn import_one(db: &DbState, shop_id: &str, entry: &Value) -> CoreResult<Value> {
    let order_ref = value_str(entry, &["orderRef", "order_ref", "orderId", "order_id"])
        .ok_or_else(|| CoreError::validation("Missing orderRef"))?;
    let description = value_str(entry, &["description", "packageDescription"])
        .ok_or_else(|| CoreError::validation("Missing description"))?;
    let cod_amount_cents = money::cents_field(entry, &["codAmount", "cod_amount"])?.unwrap_or(0);
    if cod_amount_cents < 0 {
        return Err(CoreError::validation("COD amount must not be negative"));
    }
    // Imported COD embeds the delivery fee, so no item-sum check here.
    let items = parse_items(entry)?;
    let order_name = value_str(entry, &["orderName", "order_name"]);

    let conn = db.lock()?;

    let already_sent: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM packages WHERE shop_id = ?1 AND order_ref = ?2)",
            params![shop_id, order_ref],
            |row| row.get(0),
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;
    if already_sent {
        return Err(CoreError::validation(format!(
            "Order {order_ref} already imported"
        )));
    }

    let defaults = shop_fee_defaults(&conn, shop_id)?;
    let delivery_cost_cents = defaults.0.unwrap_or(0);
    let shown_delivery_cost_cents = defaults.1;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = insert_package(
        &conn,
        &InsertPackage {
            shop_id,
            source: "imported",
            order_ref: Some(&order_ref),
            order_name: order_name.as_deref(),
            description: &description,
            initial: PackageStatus::AwaitingSchedule,
            cod_amount_cents,
            delivery_cost_cents,
            shown_delivery_cost_cents,
            schedule_pickup_time: None,
            delivery_contact_name: value_str(entry, &["deliveryContactName"]).as_deref(),
            delivery_contact_phone: value_str(entry, &["deliveryContactPhone"]).as_deref(),
            delivery_address: value_str(entry, &["deliveryAddress"]).as_deref(),
            items: &items,
        },
    );

    match result {
        Ok(mut v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            if let Some(obj) = v.as_object_mut() {
                obj.insert("orderRef".to_string(), Value::String(order_ref));
            }
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Order refs this shop has already imported (serves the bridge's
/// "sent ids" query from the authoritative store).
pub fn imported_order_refs(db: &DbState, actor: &Actor, shop_id: &str) -> CoreResult<Value> {
    auth::ensure_shop_scope(actor, shop_id)?;

    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT order_ref FROM packages
             WHERE shop_id = ?1 AND order_ref IS NOT NULL
             ORDER BY created_at ASC",
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;
    let refs: Vec<String> = stmt
        .query_map(params![shop_id], |row| row.get(0))
        .map_err(|e| CoreError::Db(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(serde_json::json!({ "sent": refs }))
}

// ---------------------------------------------------------------------------
// Delivery fees
// ---------------------------------------------------------------------------

/// Set the fee charged to the shop for this package.
///
/// Fails with `InconsistentFee` if the currently shown fee would exceed
/// the new actual fee.
pub fn set_delivery_cost(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let amount = money::require_cents(payload, &["amount"])?;
    if amount < 0 {
        return Err(CoreError::validation("Delivery cost must not be negative"));
    }

    let conn = db.lock()?;
    let pkg = PackageRow::load(&conn, &package_id)?;
    if let Some(shown) = pkg.shown_delivery_cost_cents {
        if shown > amount {
            return Err(CoreError::InconsistentFee {
                shown_cents: shown,
                cost_cents: amount,
            });
        }
    }

    conn.execute(
        "UPDATE packages SET delivery_cost_cents = ?1, updated_at = ?2 WHERE id = ?3",
        params![amount, Utc::now().to_rfc3339(), package_id],
    )
    .map_err(|e| CoreError::Db(format!("update delivery cost: {e}")))?;

    Ok(serde_json::json!({
        "success": true,
        "packageId": package_id,
        "deliveryCost": money::major_from_cents(amount),
    }))
}

/// Set the fee disclosed to the shop; bounded by the actual fee.
pub fn set_shown_delivery_cost(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let amount = money::require_cents(payload, &["amount"])?;
    if amount < 0 {
        return Err(CoreError::validation(
            "Shown delivery cost must not be negative",
        ));
    }

    let conn = db.lock()?;
    let pkg = PackageRow::load(&conn, &package_id)?;
    if amount > pkg.delivery_cost_cents {
        return Err(CoreError::InconsistentFee {
            shown_cents: amount,
            cost_cents: pkg.delivery_cost_cents,
        });
    }

    conn.execute(
        "UPDATE packages SET shown_delivery_cost_cents = ?1, updated_at = ?2 WHERE id = ?3",
        params![amount, Utc::now().to_rfc3339(), package_id],
    )
    .map_err(|e| CoreError::Db(format!("update shown delivery cost: {e}")))?;

    Ok(serde_json::json!({
        "success": true,
        "packageId": package_id,
        "shownDeliveryCost": money::major_from_cents(amount),
    }))
}

// ---------------------------------------------------------------------------
// Notes and settlement marker
// ---------------------------------------------------------------------------

/// Append a `{text, createdAt}` entry to the package notes log.
pub fn append_note(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let text = value_str(payload, &["text", "note"])
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| CoreError::validation("Note text is required"))?;

    let conn = db.lock()?;
    let pkg = PackageRow::load(&conn, &package_id)?;
    ensure_package_scope(actor, &pkg)?;

    let raw: String = conn
        .query_row(
            "SELECT notes FROM packages WHERE id = ?1",
            params![package_id],
            |row| row.get(0),
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;
    let mut notes: Vec<Value> = serde_json::from_str(&raw).unwrap_or_default();
    let now = Utc::now().to_rfc3339();
    notes.push(serde_json::json!({ "text": text, "createdAt": now }));

    conn.execute(
        "UPDATE packages SET notes = ?1, updated_at = ?2 WHERE id = ?3",
        params![Value::Array(notes.clone()).to_string(), now, package_id],
    )
    .map_err(|e| CoreError::Db(format!("append note: {e}")))?;

    Ok(serde_json::json!({
        "success": true,
        "packageId": package_id,
        "noteCount": notes.len(),
    }))
}

/// Mark whether the shop has been invoiced/settled for this package.
/// Distinct from COD collection; no ledger effect.
pub fn set_paid(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let package_id = value_str(payload, &["packageId", "package_id"])
        .ok_or_else(|| CoreError::validation("Missing packageId"))?;
    let is_paid = payload
        .get("isPaid")
        .and_then(Value::as_bool)
        .ok_or_else(|| CoreError::validation("Missing isPaid"))?;

    let conn = db.lock()?;
    PackageRow::load(&conn, &package_id)?;

    let now = Utc::now().to_rfc3339();
    let paid_at: Option<String> = is_paid.then(|| now.clone());
    conn.execute(
        "UPDATE packages SET is_paid = ?1, paid_at = ?2, updated_at = ?3 WHERE id = ?4",
        params![is_paid as i64, paid_at, now, package_id],
    )
    .map_err(|e| CoreError::Db(format!("update paid flag: {e}")))?;

    Ok(serde_json::json!({
        "success": true,
        "packageId": package_id,
        "isPaid": is_paid,
    }))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub(crate) fn ensure_package_scope(actor: &Actor, pkg: &PackageRow) -> CoreResult<()> {
    match actor {
        Actor::Admin => Ok(()),
        Actor::Shop(id) if *id == pkg.shop_id => Ok(()),
        Actor::Driver(id) if pkg.driver_id.as_deref() == Some(id.as_str()) => Ok(()),
        _ => Err(CoreError::OwnershipViolation),
    }
}

/// Full package view for its shop, its driver, or an admin.
pub fn get_package(db: &DbState, actor: &Actor, package_id: &str) -> CoreResult<Value> {
    let conn = db.lock()?;
    let pkg = PackageRow::load(&conn, package_id)?;
    ensure_package_scope(actor, &pkg)?;
    package_json(&conn, &pkg)
}

pub(crate) fn package_json(conn: &Connection, pkg: &PackageRow) -> CoreResult<Value> {
    let mut stmt = conn
        .prepare(
            "SELECT id, description, quantity, cod_amount_cents
             FROM items WHERE package_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;
    let items: Vec<Value> = stmt
        .query_map(params![pkg.id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "description": row.get::<_, String>(1)?,
                "quantity": row.get::<_, i64>(2)?,
                "codAmount": money::major_from_cents(row.get::<_, i64>(3)?),
            }))
        })
        .map_err(|e| CoreError::Db(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(serde_json::json!({
        "id": pkg.id,
        "trackingNumber": pkg.tracking_number,
        "shopId": pkg.shop_id,
        "driverId": pkg.driver_id,
        "status": pkg.status.as_str(),
        "statusHistory": pkg.status_history,
        "codAmount": money::major_from_cents(pkg.cod_amount_cents),
        "deliveryCost": money::major_from_cents(pkg.delivery_cost_cents),
        "shownDeliveryCost": pkg.shown_delivery_cost_cents.map(money::major_from_cents),
        "items": items,
        "deliveredItems": pkg.delivered_items,
        "returnDetails": pkg.return_details,
        "returnRefundAmount": money::major_from_cents(pkg.return_refund_cents),
        "exchangeDetails": pkg.exchange_details,
    }))
}

/// Public tracking view: limited fields, no authentication.
pub fn track_package(db: &DbState, tracking_number: &str) -> CoreResult<Value> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT tracking_number, status, status_history, description, created_at
         FROM packages WHERE tracking_number = ?1",
        params![tracking_number],
        |row| {
            let history: String = row.get(2)?;
            Ok(serde_json::json!({
                "trackingNumber": row.get::<_, String>(0)?,
                "status": row.get::<_, String>(1)?,
                "statusHistory": serde_json::from_str::<Value>(&history)
                    .unwrap_or(Value::Array(vec![])),
                "description": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        },
    )
    .optional()
    .map_err(|e| CoreError::Db(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("Package {tracking_number}")))
}

// ===========================================================================
// Tests
// ===========================================================================
