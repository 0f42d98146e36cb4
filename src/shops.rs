//! Shop records and the explicit shop-deletion cascade.
//!
//! The shop aggregate owns its packages, pickups and money transaction
//! log. Deleting a shop is the only path that deletes packages, and it is
//! an explicit, transactional operation here rather than a storage-engine
//! side effect, so it can be tested to leave every other shop untouched.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::money;
use crate::value_str;

/// Register a shop (called by the external onboarding flow once approved).
pub fn create_shop(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let business_name = value_str(payload, &["businessName", "business_name"])
        .ok_or_else(|| CoreError::validation("Missing businessName"))?;

    let shipping_fees = money::cents_field(payload, &["shippingFees", "shipping_fees"])?;
    let shown_shipping_fees =
        money::cents_field(payload, &["shownShippingFees", "shown_shipping_fees"])?;
    if let Some(fee) = shipping_fees {
        if fee < 0 {
            return Err(CoreError::validation("Shipping fees must not be negative"));
        }
    }
    if let Some(shown) = shown_shipping_fees {
        if shown < 0 {
            return Err(CoreError::validation(
                "Shown shipping fees must not be negative",
            ));
        }
        let cost = shipping_fees.unwrap_or(0);
        if shown > cost {
            return Err(CoreError::InconsistentFee {
                shown_cents: shown,
                cost_cents: cost,
            });
        }
    }

    let conn = db.lock()?;
    let shop_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO shops (
            id, business_name, contact_person_name, contact_person_phone,
            contact_person_email, address, api_key,
            shipping_fees_cents, shown_shipping_fees_cents,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            shop_id,
            business_name,
            value_str(payload, &["contactPersonName"]),
            value_str(payload, &["contactPersonPhone"]),
            value_str(payload, &["contactPersonEmail"]),
            value_str(payload, &["address"]),
            value_str(payload, &["apiKey", "api_key"]),
            shipping_fees,
            shown_shipping_fees,
            now,
        ],
    )
    .map_err(|e| CoreError::Db(format!("insert shop: {e}")))?;

    info!(shop_id = %shop_id, business_name = %business_name, "Shop created");

    Ok(serde_json::json!({
        "success": true,
        "id": shop_id,
        "businessName": business_name,
    }))
}

/// Shop profile with balances and package count.
pub fn get_shop(db: &DbState, actor: &Actor, shop_id: &str) -> CoreResult<Value> {
    auth::ensure_shop_scope(actor, shop_id)?;

    let conn = db.lock()?;
    let shop = conn
        .query_row(
            "SELECT business_name, contact_person_name, contact_person_phone,
                    contact_person_email, address,
                    to_collect_cents, total_collected_cents, settled_cents,
                    shipping_fees_cents, shown_shipping_fees_cents, created_at
             FROM shops WHERE id = ?1",
            params![shop_id],
            |row| {
                Ok(serde_json::json!({
                    "id": shop_id,
                    "businessName": row.get::<_, String>(0)?,
                    "contactPersonName": row.get::<_, Option<String>>(1)?,
                    "contactPersonPhone": row.get::<_, Option<String>>(2)?,
                    "contactPersonEmail": row.get::<_, Option<String>>(3)?,
                    "address": row.get::<_, Option<String>>(4)?,
                    "toCollect": money::major_from_cents(row.get::<_, i64>(5)?),
                    "totalCollected": money::major_from_cents(row.get::<_, i64>(6)?),
                    "settled": money::major_from_cents(row.get::<_, i64>(7)?),
                    "shippingFees": row.get::<_, Option<i64>>(8)?.map(money::major_from_cents),
                    "shownShippingFees": row.get::<_, Option<i64>>(9)?.map(money::major_from_cents),
                    "createdAt": row.get::<_, String>(10)?,
                }))
            },
        )
        .optional()
        .map_err(|e| CoreError::Db(e.to_string()))?
        .ok_or_else(|| CoreError::NotFound(format!("Shop {shop_id}")))?;

    let package_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM packages WHERE shop_id = ?1",
            params![shop_id],
            |row| row.get(0),
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;

    let mut shop = shop;
    if let Some(obj) = shop.as_object_mut() {
        obj.insert("packageCount".to_string(), package_count.into());
    }
    Ok(shop)
}

/// Update the shop's default delivery fees (applied to imported packages).
pub fn update_shop_fees(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let shop_id = value_str(payload, &["shopId", "shop_id"])
        .ok_or_else(|| CoreError::validation("Missing shopId"))?;

    let conn = db.lock()?;
    let (current_fees, current_shown): (Option<i64>, Option<i64>) = conn
        .query_row(
            "SELECT shipping_fees_cents, shown_shipping_fees_cents FROM shops WHERE id = ?1",
            params![shop_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| CoreError::Db(e.to_string()))?
        .ok_or_else(|| CoreError::NotFound(format!("Shop {shop_id}")))?;

    let fees = money::cents_field(payload, &["shippingFees", "shipping_fees"])?
        .or(current_fees);
    let shown = money::cents_field(payload, &["shownShippingFees", "shown_shipping_fees"])?
        .or(current_shown);
    if let Some(fee) = fees {
        if fee < 0 {
            return Err(CoreError::validation("Shipping fees must not be negative"));
        }
    }
    if let Some(shown_fee) = shown {
        if shown_fee < 0 {
            return Err(CoreError::validation(
                "Shown shipping fees must not be negative",
            ));
        }
        if shown_fee > fees.unwrap_or(0) {
            return Err(CoreError::InconsistentFee {
                shown_cents: shown_fee,
                cost_cents: fees.unwrap_or(0),
            });
        }
    }

    conn.execute(
        "UPDATE shops SET shipping_fees_cents = ?1, shown_shipping_fees_cents = ?2,
            updated_at = ?3
         WHERE id = ?4",
        params![fees, shown, Utc::now().to_rfc3339(), shop_id],
    )
    .map_err(|e| CoreError::Db(format!("update shop fees: {e}")))?;

    Ok(serde_json::json!({
        "success": true,
        "shopId": shop_id,
        "shippingFees": fees.map(money::major_from_cents),
        "shownShippingFees": shown.map(money::major_from_cents),
    }))
}

/// Delete a shop and everything it owns.
///
/// Removes the shop's packages (items and assignment rows follow via
/// their package FK), pickups, and money transaction log in one
/// transaction. Other shops' rows are never touched.
pub fn delete_shop(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;
    let shop_id = value_str(payload, &["shopId", "shop_id"])
        .ok_or_else(|| CoreError::validation("Missing shopId"))?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM shops WHERE id = ?1)",
                params![shop_id],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::Db(e.to_string()))?;
        if !exists {
            return Err(CoreError::NotFound(format!("Shop {shop_id}")));
        }

        // Packages first (items/assignments cascade off them), then the
        // pickups they referenced, then the ledger log, then the shop row.
        let packages = conn
            .execute(
                "DELETE FROM packages WHERE shop_id = ?1",
                params![shop_id],
            )
            .map_err(|e| CoreError::Db(format!("delete packages: {e}")))?;
        let pickups = conn
            .execute("DELETE FROM pickups WHERE shop_id = ?1", params![shop_id])
            .map_err(|e| CoreError::Db(format!("delete pickups: {e}")))?;
        let transactions = conn
            .execute(
                "DELETE FROM money_transactions WHERE shop_id = ?1",
                params![shop_id],
            )
            .map_err(|e| CoreError::Db(format!("delete transactions: {e}")))?;
        conn.execute("DELETE FROM shops WHERE id = ?1", params![shop_id])
            .map_err(|e| CoreError::Db(format!("delete shop: {e}")))?;

        Ok(serde_json::json!({
            "success": true,
            "shopId": shop_id,
            "deletedPackages": packages,
            "deletedPickups": pickups,
            "deletedTransactions": transactions,
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                shop_id = %shop_id,
                packages = %v["deletedPackages"],
                "Shop deleted with cascade"
            );
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
