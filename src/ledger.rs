//! Per-shop COD money ledger.
//!
//! Each shop carries three running balances: `to_collect` (expected from
//! customers, not yet settled), `total_collected` (collected via COD, held
//! by the platform pending settlement) and `settled` (cumulative paid out).
//! Every change to any balance is mirrored by exactly one row in the
//! append-only `money_transactions` log, inside the same transaction.
//!
//! **Rules:**
//! - Balances never go negative; a violating write is rejected atomically
//! - The balances are a derived cache: replaying the log from zero must
//!   reproduce them exactly (see [`replay_balances`])
//! - No automatic retries; callers resubmit after correcting input

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::auth::{self, Actor};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::events;
use crate::money;
use crate::value_str;

// ---------------------------------------------------------------------------
// Attributes and change types
// ---------------------------------------------------------------------------

/// The three shop balances tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAttribute {
    ToCollect,
    TotalCollected,
    Settled,
}

impl LedgerAttribute {
    /// Wire/storage name, matching the `money_transactions.attribute` CHECK.
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerAttribute::ToCollect => "to_collect",
            LedgerAttribute::TotalCollected => "total_collected",
            LedgerAttribute::Settled => "settled",
        }
    }

    /// Column on `shops` caching this balance.
    fn column(self) -> &'static str {
        match self {
            LedgerAttribute::ToCollect => "to_collect_cents",
            LedgerAttribute::TotalCollected => "total_collected_cents",
            LedgerAttribute::Settled => "settled_cents",
        }
    }

    /// Parse a wire name. Accepts the dashboard's historical CamelCase
    /// labels as aliases.
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "to_collect" | "ToCollect" => Ok(LedgerAttribute::ToCollect),
            "total_collected" | "TotalCollected" => Ok(LedgerAttribute::TotalCollected),
            "settled" | "Settled" => Ok(LedgerAttribute::Settled),
            other => Err(CoreError::validation(format!(
                "Unknown ledger attribute: {other}"
            ))),
        }
    }
}

/// Direction of a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Increase,
    Decrease,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Increase => "increase",
            ChangeType::Decrease => "decrease",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "increase" => Ok(ChangeType::Increase),
            "decrease" => Ok(ChangeType::Decrease),
            other => Err(CoreError::validation(format!(
                "Unknown change type: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Core write path
// ---------------------------------------------------------------------------

/// Apply one balance change and log its transaction row.
///
/// Runs inside the caller's transaction. Re-reads the balance, rejects a
/// write that would leave it negative, updates the cached column, and
/// appends exactly one `money_transactions` row. Returns the new balance.
pub(crate) fn apply_change(
    conn: &Connection,
    shop_id: &str,
    package_id: Option<&str>,
    attribute: LedgerAttribute,
    change: ChangeType,
    amount_cents: i64,
    reason: &str,
) -> CoreResult<i64> {
    if amount_cents <= 0 {
        return Err(CoreError::validation("Amount must be positive"));
    }
    if reason.trim().is_empty() {
        return Err(CoreError::validation("Reason is required"));
    }

    let column = attribute.column();
    let current: i64 = conn
        .query_row(
            &format!("SELECT {column} FROM shops WHERE id = ?1"),
            params![shop_id],
            |row| row.get(0),
        )
        .map_err(|_| CoreError::NotFound(format!("Shop {shop_id}")))?;

    let new_balance = match change {
        ChangeType::Increase => current + amount_cents,
        ChangeType::Decrease => current - amount_cents,
    };
    if new_balance < 0 {
        return Err(CoreError::InsufficientBalance {
            attribute: attribute.as_str(),
            requested_cents: amount_cents,
            available_cents: current,
        });
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        &format!("UPDATE shops SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
        params![new_balance, now, shop_id],
    )
    .map_err(|e| CoreError::Db(format!("update shop balance: {e}")))?;

    conn.execute(
        "INSERT INTO money_transactions
            (shop_id, package_id, attribute, change_type, amount_cents, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            shop_id,
            package_id,
            attribute.as_str(),
            change.as_str(),
            amount_cents,
            reason,
            now,
        ],
    )
    .map_err(|e| CoreError::Db(format!("insert money transaction: {e}")))?;

    Ok(new_balance)
}

// ---------------------------------------------------------------------------
// Lifecycle hooks (called inside the transition engine's transaction)
// ---------------------------------------------------------------------------

/// Package delivered: the driver now holds the COD on the platform's
/// behalf, so it lands in `total_collected`. Exactly one transaction.
pub(crate) fn on_delivered(
    conn: &Connection,
    shop_id: &str,
    package_id: &str,
    cod_cents: i64,
) -> CoreResult<()> {
    if cod_cents > 0 {
        apply_change(
            conn,
            shop_id,
            Some(package_id),
            LedgerAttribute::TotalCollected,
            ChangeType::Increase,
            cod_cents,
            "COD collected at delivery",
        )?;
    }
    Ok(())
}

/// Package entered the cancel or reject branch.
///
/// COD is only ever collected at delivery, and both branches fork off
/// strictly before `delivered`, so there is nothing to reverse here; the
/// hook keeps every branch entry and its (possibly empty) money effect in
/// one place. The later `*-returned` hop does not re-enter this hook.
pub(crate) fn on_cancelled(
    conn: &Connection,
    shop_id: &str,
    package_id: &str,
    rejected: bool,
) -> CoreResult<()> {
    // Shop must still exist; a dangling package is a storage fault.
    let _: i64 = conn
        .query_row(
            "SELECT to_collect_cents FROM shops WHERE id = ?1",
            params![shop_id],
            |row| row.get(0),
        )
        .map_err(|_| CoreError::NotFound(format!("Shop {shop_id}")))?;
    tracing::debug!(
        shop_id = %shop_id,
        package_id = %package_id,
        rejected = rejected,
        "Cancel/reject branch entered before delivery; no collected COD to reverse"
    );
    Ok(())
}

/// Signed correction from the return/exchange reconciler.
///
/// Negative delta refunds money to the customer (decrease), positive delta
/// records additional money owed (increase). A zero delta is a no-op.
pub(crate) fn on_return_or_exchange(
    conn: &Connection,
    shop_id: &str,
    package_id: &str,
    delta_cents: i64,
    reason: &str,
) -> CoreResult<()> {
    if delta_cents == 0 {
        return Ok(());
    }
    let (change, magnitude) = if delta_cents < 0 {
        (ChangeType::Decrease, -delta_cents)
    } else {
        (ChangeType::Increase, delta_cents)
    };
    apply_change(
        conn,
        shop_id,
        Some(package_id),
        LedgerAttribute::TotalCollected,
        change,
        magnitude,
        reason,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Settle collected COD out to the shop.
///
/// Moves `amount` (default: the full current `total_collected`) from
/// `total_collected` to `settled`. Fails with `InsufficientBalance` when
/// the requested amount exceeds the held balance.
pub fn settle(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;

    let shop_id = value_str(payload, &["shopId", "shop_id"])
        .ok_or_else(|| CoreError::validation("Missing shopId"))?;
    let requested = money::cents_field(payload, &["amount"])?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let available: i64 = conn
            .query_row(
                "SELECT total_collected_cents FROM shops WHERE id = ?1",
                params![shop_id],
                |row| row.get(0),
            )
            .map_err(|_| CoreError::NotFound(format!("Shop {shop_id}")))?;

        let amount = match requested {
            Some(cents) => {
                if cents <= 0 {
                    return Err(CoreError::validation("Settlement amount must be positive"));
                }
                cents
            }
            None => available,
        };
        if amount == 0 {
            return Err(CoreError::validation("Nothing to settle"));
        }
        if amount > available {
            return Err(CoreError::InsufficientBalance {
                attribute: LedgerAttribute::TotalCollected.as_str(),
                requested_cents: amount,
                available_cents: available,
            });
        }

        let remaining = apply_change(
            &conn,
            &shop_id,
            None,
            LedgerAttribute::TotalCollected,
            ChangeType::Decrease,
            amount,
            "Settlement paid out to shop",
        )?;
        let settled_total = apply_change(
            &conn,
            &shop_id,
            None,
            LedgerAttribute::Settled,
            ChangeType::Increase,
            amount,
            "Settlement paid out to shop",
        )?;

        events::record_event(
            &conn,
            "shop.ledgerAdjusted",
            &shop_id,
            &serde_json::json!({
                "operation": "settle",
                "amount": money::major_from_cents(amount),
            }),
        )?;

        Ok(serde_json::json!({
            "success": true,
            "shopId": shop_id,
            "amountSettled": money::major_from_cents(amount),
            "previousBalance": money::major_from_cents(available),
            "currentBalance": money::major_from_cents(remaining),
            "settledTotal": money::major_from_cents(settled_total),
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                shop_id = %shop_id,
                amount = %v["amountSettled"],
                "Settlement recorded"
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
// Manual adjustment
// ---------------------------------------------------------------------------

/// Manual operator correction on one balance.
///
/// `reason` is mandatory; the adjustment produces exactly one money
/// transaction and rejects atomically if the balance would go negative.
pub fn adjust(db: &DbState, actor: &Actor, payload: &Value) -> CoreResult<Value> {
    auth::ensure_admin(actor)?;

    let shop_id = value_str(payload, &["shopId", "shop_id"])
        .ok_or_else(|| CoreError::validation("Missing shopId"))?;
    let attribute = LedgerAttribute::parse(
        &value_str(payload, &["attribute"])
            .ok_or_else(|| CoreError::validation("Missing attribute"))?,
    )?;
    let change = ChangeType::parse(
        &value_str(payload, &["changeType", "change_type"])
            .ok_or_else(|| CoreError::validation("Missing changeType"))?,
    )?;
    let amount = money::require_positive_cents(payload, &["amount"])?;
    let reason = value_str(payload, &["reason"])
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| CoreError::validation("Reason is required"))?;

    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

    let result = (|| -> CoreResult<Value> {
        let balance = apply_change(&conn, &shop_id, None, attribute, change, amount, &reason)?;

        events::record_event(
            &conn,
            "shop.ledgerAdjusted",
            &shop_id,
            &serde_json::json!({
                "operation": "adjust",
                "attribute": attribute.as_str(),
                "changeType": change.as_str(),
                "amount": money::major_from_cents(amount),
                "reason": reason,
            }),
        )?;

        Ok(serde_json::json!({
            "success": true,
            "shopId": shop_id,
            "attribute": attribute.as_str(),
            "changeType": change.as_str(),
            "amount": money::major_from_cents(amount),
            "balance": money::major_from_cents(balance),
        }))
    })();

    match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
            info!(
                shop_id = %shop_id,
                attribute = %attribute.as_str(),
                change = %change.as_str(),
                "Manual ledger adjustment"
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
// Queries and audit
// ---------------------------------------------------------------------------

/// Current cached balances for a shop.
pub fn get_balances(db: &DbState, actor: &Actor, shop_id: &str) -> CoreResult<Value> {
    auth::ensure_shop_scope(actor, shop_id)?;

    let conn = db.lock()?;
    balances_json(&conn, shop_id)
}

fn balances_json(conn: &Connection, shop_id: &str) -> CoreResult<Value> {
    let (to_collect, total_collected, settled): (i64, i64, i64) = conn
        .query_row(
            "SELECT to_collect_cents, total_collected_cents, settled_cents
             FROM shops WHERE id = ?1",
            params![shop_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|_| CoreError::NotFound(format!("Shop {shop_id}")))?;

    Ok(serde_json::json!({
        "shopId": shop_id,
        "toCollect": money::major_from_cents(to_collect),
        "totalCollected": money::major_from_cents(total_collected),
        "settled": money::major_from_cents(settled),
    }))
}

/// List a shop's money transactions, newest first.
pub fn list_transactions(db: &DbState, actor: &Actor, shop_id: &str) -> CoreResult<Value> {
    auth::ensure_shop_scope(actor, shop_id)?;

    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, package_id, attribute, change_type, amount_cents, reason, created_at
             FROM money_transactions
             WHERE shop_id = ?1
             ORDER BY id DESC",
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;

    let rows = stmt
        .query_map(params![shop_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, i64>(0)?,
                "packageId": row.get::<_, Option<String>>(1)?,
                "attribute": row.get::<_, String>(2)?,
                "changeType": row.get::<_, String>(3)?,
                "amount": money::major_from_cents(row.get::<_, i64>(4)?),
                "reason": row.get::<_, String>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| CoreError::Db(e.to_string()))?;

    let transactions: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!({ "shopId": shop_id, "transactions": transactions }))
}

/// Replay the transaction log from zero and compare with the cached
/// balances. The two must always agree; a drift indicates a write that
/// bypassed the ledger.
pub fn replay_balances(db: &DbState, shop_id: &str) -> CoreResult<Value> {
    let conn = db.lock()?;

    // Make sure the shop exists before replaying an empty log.
    let stored = balances_json(&conn, shop_id)?;

    let mut replayed = [0i64; 3];
    let mut stmt = conn
        .prepare(
            "SELECT attribute, change_type, amount_cents
             FROM money_transactions
             WHERE shop_id = ?1
             ORDER BY id ASC",
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;
    let mut rows = stmt
        .query(params![shop_id])
        .map_err(|e| CoreError::Db(e.to_string()))?;

    while let Some(row) = rows.next().map_err(|e| CoreError::Db(e.to_string()))? {
        let attribute: String = row.get(0)?;
        let change_type: String = row.get(1)?;
        let amount: i64 = row.get(2)?;

        let slot = match LedgerAttribute::parse(&attribute)? {
            LedgerAttribute::ToCollect => 0,
            LedgerAttribute::TotalCollected => 1,
            LedgerAttribute::Settled => 2,
        };
        match ChangeType::parse(&change_type)? {
            ChangeType::Increase => replayed[slot] += amount,
            ChangeType::Decrease => replayed[slot] -= amount,
        }
    }

    let replayed_json = serde_json::json!({
        "toCollect": money::major_from_cents(replayed[0]),
        "totalCollected": money::major_from_cents(replayed[1]),
        "settled": money::major_from_cents(replayed[2]),
    });
    let matches = stored["toCollect"] == replayed_json["toCollect"]
        && stored["totalCollected"] == replayed_json["totalCollected"]
        && stored["settled"] == replayed_json["settled"];

    Ok(serde_json::json!({
        "shopId": shop_id,
        "stored": {
            "toCollect": stored["toCollect"],
            "totalCollected": stored["totalCollected"],
            "settled": stored["settled"],
        },
        "replayed": replayed_json,
        "matches": matches,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
