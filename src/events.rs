//! Logical event outbox.
//!
//! State changes append rows here inside the same transaction that commits
//! the change, so an event exists if and only if its state change does. An
//! external notifier drains the outbox; the core never waits for delivery.
//!
//! Event names: `package.statusChanged`, `package.delivered`,
//! `shop.ledgerAdjusted`.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};

/// Append an event row. Called inside the caller's transaction.
pub(crate) fn record_event(
    conn: &Connection,
    name: &str,
    entity_id: &str,
    payload: &Value,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO events (name, entity_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            name,
            entity_id,
            payload.to_string(),
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| CoreError::Db(format!("record event: {e}")))?;
    Ok(())
}

/// List undispatched events, oldest first.
pub fn pending_events(db: &DbState, limit: i64) -> CoreResult<Value> {
    let conn = db.lock()?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, entity_id, payload, created_at
             FROM events
             WHERE dispatched_at IS NULL
             ORDER BY id ASC
             LIMIT ?1",
        )
        .map_err(|e| CoreError::Db(e.to_string()))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            let payload: String = row.get(3)?;
            Ok(serde_json::json!({
                "id": row.get::<_, i64>(0)?,
                "name": row.get::<_, String>(1)?,
                "entityId": row.get::<_, String>(2)?,
                "payload": serde_json::from_str::<Value>(&payload).unwrap_or(Value::Null),
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .map_err(|e| CoreError::Db(e.to_string()))?;

    let events: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!({ "events": events }))
}

/// Mark a batch of events as handed to the notifier.
pub fn mark_dispatched(db: &DbState, ids: &[i64]) -> CoreResult<Value> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    let mut updated = 0usize;
    for id in ids {
        updated += conn
            .execute(
                "UPDATE events SET dispatched_at = ?1 WHERE id = ?2 AND dispatched_at IS NULL",
                params![now, id],
            )
            .map_err(|e| CoreError::Db(format!("mark dispatched: {e}")))?;
    }

    Ok(serde_json::json!({ "dispatched": updated }))
}

// ===========================================================================
// Tests
// ===========================================================================
