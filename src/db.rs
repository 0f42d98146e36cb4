//! Local SQLite database layer for The Small Dispatch.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! [`DbState`] handle used across the core. The connection mutex plus
//! `BEGIN IMMEDIATE` transactions in the operation modules serialize all
//! mutations to a package's status and a shop's ledger balances, so two
//! concurrent writers can never both read a stale balance.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex into a core error.
    pub fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CoreError::Db(e.to_string()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 6;

/// Initialize the database at `{data_dir}/dispatch.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> CoreResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| CoreError::Db(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("dispatch.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| CoreError::Db(format!("Database open failed after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> CoreResult<Connection> {
    let conn =
        Connection::open(path).map_err(|e| CoreError::Db(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| CoreError::Db(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> CoreResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| CoreError::Db(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }
    if current < 5 {
        migrate_v5(conn)?;
    }
    if current < 6 {
        migrate_v6(conn)?;
    }

    Ok(())
}

/// Migration v1: shops and drivers.
///
/// Shop ledger balances live directly on the shop row as integer cents.
/// They are a derived cache of the `money_transactions` log (v4); replaying
/// the log from zero must reproduce them exactly.
fn migrate_v1(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- shops (ledger balances as integer cents)
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            business_name TEXT NOT NULL,
            contact_person_name TEXT,
            contact_person_phone TEXT,
            contact_person_email TEXT,
            address TEXT,
            api_key TEXT UNIQUE,
            to_collect_cents INTEGER NOT NULL DEFAULT 0,
            total_collected_cents INTEGER NOT NULL DEFAULT 0,
            settled_cents INTEGER NOT NULL DEFAULT 0,
            shipping_fees_cents INTEGER,
            shown_shipping_fees_cents INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- drivers (counters are derived from assignment history, never stored)
        CREATE TABLE IF NOT EXISTS drivers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            vehicle_type TEXT NOT NULL
                CHECK (vehicle_type IN ('car', 'motorcycle', 'bicycle', 'van', 'truck')),
            license_plate TEXT,
            is_available INTEGER NOT NULL DEFAULT 1,
            working_area TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_shops_business_name ON shops(business_name);
        CREATE INDEX IF NOT EXISTS idx_drivers_is_available ON drivers(is_available);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        CoreError::Db(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (shops, drivers)");
    Ok(())
}

/// Migration v2: packages and items.
fn migrate_v2(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- packages
        CREATE TABLE IF NOT EXISTS packages (
            id TEXT PRIMARY KEY,
            tracking_number TEXT UNIQUE NOT NULL,
            shop_id TEXT NOT NULL REFERENCES shops(id),
            driver_id TEXT REFERENCES drivers(id),
            source TEXT NOT NULL DEFAULT 'manual'
                CHECK (source IN ('manual', 'imported')),
            order_ref TEXT,
            order_name TEXT,
            description TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'awaiting_schedule'
                CHECK (status IN (
                    'awaiting_schedule', 'scheduled_for_pickup', 'pending',
                    'assigned', 'pickedup', 'in-transit', 'delivered',
                    'cancelled', 'cancelled-awaiting-return', 'cancelled-returned',
                    'rejected', 'rejected-awaiting-return', 'rejected-returned',
                    'return-requested', 'return-in-transit', 'return-pending',
                    'return-completed'
                )),
            status_history TEXT NOT NULL DEFAULT '[]',
            notes TEXT NOT NULL DEFAULT '[]',
            cod_amount_cents INTEGER NOT NULL DEFAULT 0,
            delivery_cost_cents INTEGER NOT NULL DEFAULT 0,
            shown_delivery_cost_cents INTEGER,
            is_paid INTEGER NOT NULL DEFAULT 0,
            paid_at TEXT,
            schedule_pickup_time TEXT,
            picked_up_at TEXT,
            delivered_at TEXT,
            delivery_contact_name TEXT,
            delivery_contact_phone TEXT,
            delivery_address TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- items (per-package COD breakdown)
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            package_id TEXT NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            description TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1 CHECK (quantity > 0),
            cod_amount_cents INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_packages_shop_id ON packages(shop_id);
        CREATE INDEX IF NOT EXISTS idx_packages_driver_id ON packages(driver_id);
        CREATE INDEX IF NOT EXISTS idx_packages_status ON packages(status);
        CREATE INDEX IF NOT EXISTS idx_packages_created_at ON packages(created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_packages_shop_order_ref
            ON packages(shop_id, order_ref)
            WHERE order_ref IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_items_package_id ON items(package_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        CoreError::Db(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (packages, items)");
    Ok(())
}

/// Migration v3: pickup batches.
fn migrate_v3(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- pickups (batch of packages collected from a shop in one trip)
        CREATE TABLE IF NOT EXISTS pickups (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL REFERENCES shops(id),
            driver_id TEXT REFERENCES drivers(id),
            scheduled_time TEXT NOT NULL,
            pickup_address TEXT,
            status TEXT NOT NULL DEFAULT 'open'
                CHECK (status IN ('open', 'picked_up', 'cancelled')),
            actual_pickup_time TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        ALTER TABLE packages ADD COLUMN pickup_id TEXT REFERENCES pickups(id);

        CREATE INDEX IF NOT EXISTS idx_pickups_shop_id ON pickups(shop_id);
        CREATE INDEX IF NOT EXISTS idx_pickups_status ON pickups(status);
        CREATE INDEX IF NOT EXISTS idx_packages_pickup_id ON packages(pickup_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        CoreError::Db(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (pickups)");
    Ok(())
}

/// Migration v4: append-only money transaction log.
///
/// Every change to a shop balance is mirrored by exactly one row here.
/// Rows are never updated or deleted.
fn migrate_v4(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- money_transactions (append-only ledger audit trail)
        CREATE TABLE IF NOT EXISTS money_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            shop_id TEXT NOT NULL REFERENCES shops(id),
            package_id TEXT,
            attribute TEXT NOT NULL
                CHECK (attribute IN ('to_collect', 'total_collected', 'settled')),
            change_type TEXT NOT NULL
                CHECK (change_type IN ('increase', 'decrease')),
            amount_cents INTEGER NOT NULL CHECK (amount_cents > 0),
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_money_transactions_shop_id
            ON money_transactions(shop_id);
        CREATE INDEX IF NOT EXISTS idx_money_transactions_created_at
            ON money_transactions(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        CoreError::Db(format!("migration v4: {e}"))
    })?;

    info!("Applied migration v4 (money_transactions)");
    Ok(())
}

/// Migration v5: assignment history and the event outbox.
fn migrate_v5(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- package_assignments (append-only driver handoff history)
        CREATE TABLE IF NOT EXISTS package_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id TEXT NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            driver_id TEXT NOT NULL REFERENCES drivers(id),
            assigned_at TEXT NOT NULL,
            released_at TEXT,
            outcome TEXT
                CHECK (outcome IN ('delivered', 'cancelled', 'rejected', 'reassigned'))
        );

        -- events (append-only outbox drained by the external notifier)
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            dispatched_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_package_assignments_package
            ON package_assignments(package_id);
        CREATE INDEX IF NOT EXISTS idx_package_assignments_driver
            ON package_assignments(driver_id);
        CREATE INDEX IF NOT EXISTS idx_package_assignments_active
            ON package_assignments(driver_id, released_at);
        CREATE INDEX IF NOT EXISTS idx_events_pending
            ON events(dispatched_at, id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (5);
        ",
    )
    .map_err(|e| {
        error!("Migration v5 failed: {e}");
        CoreError::Db(format!("migration v5: {e}"))
    })?;

    info!("Applied migration v5 (package_assignments, events)");
    Ok(())
}

/// Migration v6: return and exchange reconciliation fields.
///
/// `delivered_items` is fixed once at delivery and never changed after;
/// `return_details` accumulates across partial returns; `exchange_details`
/// holds at most one in-flight exchange.
fn migrate_v6(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE packages ADD COLUMN delivered_items TEXT;

        ALTER TABLE packages ADD COLUMN return_details TEXT;

        ALTER TABLE packages ADD COLUMN return_refund_cents INTEGER NOT NULL DEFAULT 0;

        ALTER TABLE packages ADD COLUMN exchange_details TEXT;

        -- Record migration
        INSERT INTO schema_version (version) VALUES (6);
        ",
    )
    .map_err(|e| {
        error!("Migration v6 failed: {e}");
        CoreError::Db(format!("migration v6: {e}"))
    })?;

    info!("Applied migration v6 (return/exchange fields)");
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{params, Connection};

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for table in [
            "shops",
            "drivers",
            "packages",
            "items",
            "pickups",
            "money_transactions",
            "package_assignments",
            "events",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        // v6 columns exist (query succeeds even on the empty table)
        conn.prepare(
            "SELECT delivered_items, return_details, return_refund_cents, exchange_details
             FROM packages LIMIT 0",
        )
        .expect("v6 columns should exist");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_init_on_file_db() -> anyhow::Result<()> {
        // WAL only applies to file-backed databases, so exercise the full
        // init path against a temp directory.
        let dir = std::env::temp_dir().join("dispatch_test_init_wal");
        let _ = std::fs::remove_dir_all(&dir);

        let state = init(&dir)?;
        {
            let conn = state.conn.lock().expect("lock connection");
            let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
            let version: i32 =
                conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })?;
            assert_eq!(version, CURRENT_SCHEMA_VERSION);
        }

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_packages_status_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
            [],
        )
        .expect("insert shop");

        // A status outside the closed enumeration is rejected by storage too.
        let bad = conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, status, created_at, updated_at)
             VALUES ('pkg-bad', 'DP0001', 'shop-1', 'Box', 'returned', datetime('now'), datetime('now'))",
            [],
        );
        assert!(bad.is_err(), "unknown status should violate CHECK");

        conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, status, created_at, updated_at)
             VALUES ('pkg-ok', 'DP0002', 'shop-1', 'Box', 'pending', datetime('now'), datetime('now'))",
            [],
        )
        .expect("valid status accepted");
    }

    #[test]
    fn test_items_cascade_with_package() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, created_at, updated_at)
             VALUES ('pkg-1', 'DP0003', 'shop-1', 'Box', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO items (id, package_id, description, quantity, cod_amount_cents, created_at)
             VALUES ('item-1', 'pkg-1', 'Shirt', 2, 1000, datetime('now'))",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM packages WHERE id = 'pkg-1'", [])
            .expect("delete package");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "items should cascade-delete with their package");
    }

    #[test]
    fn test_shop_delete_does_not_cascade_to_packages() {
        // Shop deletion is an explicit cascade operation in shops.rs, not a
        // storage-engine side effect; the FK must block an implicit delete.
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, created_at, updated_at)
             VALUES ('pkg-1', 'DP0004', 'shop-1', 'Box', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        let result = conn.execute("DELETE FROM shops WHERE id = 'shop-1'", []);
        assert!(
            result.is_err(),
            "deleting a shop with packages must be blocked at the storage layer"
        );
    }

    #[test]
    fn test_money_transactions_reject_non_positive_amounts() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-1', 'Test Shop', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        for amount in [0i64, -100] {
            let result = conn.execute(
                "INSERT INTO money_transactions
                    (shop_id, attribute, change_type, amount_cents, reason, created_at)
                 VALUES ('shop-1', 'to_collect', 'increase', ?1, 'test', datetime('now'))",
                params![amount],
            );
            assert!(result.is_err(), "amount {amount} should violate CHECK");
        }
    }

    #[test]
    fn test_duplicate_order_ref_rejected_per_shop() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-1', 'Shop A', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO shops (id, business_name, created_at, updated_at)
             VALUES ('shop-2', 'Shop B', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, order_ref, created_at, updated_at)
             VALUES ('pkg-1', 'DP0005', 'shop-1', 'Box', 'ord-9', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        // Same order_ref for the same shop is a duplicate import.
        let dup = conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, order_ref, created_at, updated_at)
             VALUES ('pkg-2', 'DP0006', 'shop-1', 'Box', 'ord-9', datetime('now'), datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "duplicate order_ref per shop should be rejected");

        // A different shop may import the same order_ref.
        conn.execute(
            "INSERT INTO packages (id, tracking_number, shop_id, description, order_ref, created_at, updated_at)
             VALUES ('pkg-3', 'DP0007', 'shop-2', 'Box', 'ord-9', datetime('now'), datetime('now'))",
            [],
        )
        .expect("other shop may reuse the order_ref");
    }
}
