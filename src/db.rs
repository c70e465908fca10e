//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the transaction
//! helper every multi-row write goes through, local settings and the
//! singleton sync metadata row.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{now_timestamp, SyncMetadata};

/// Shared handle to the local database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

impl DbState {
    /// Initialize the database at `{data_dir}/orders.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. The file holds the only copy of
    /// unsynced work, so open failures are returned as-is. A file SQLite
    /// reports as corrupt is renamed to `orders.db.corrupt-<ts>` and a fresh
    /// database is created in its place.
    pub fn open(data_dir: &Path) -> Result<DbState, StoreError> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("orders.db");
        info!("Opening database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) if is_corruption(&first_err) => {
                let aside = quarantine_file(&db_path)?;
                warn!(
                    "Database is corrupt ({}), moved to {} and starting fresh",
                    first_err,
                    aside.display()
                );
                open_and_configure(&db_path)?
            }
            Err(e) => return Err(e),
        };

        run_migrations(&conn)?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(DbState {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Fresh migrated database that lives only as long as the handle.
    pub fn open_in_memory() -> Result<DbState, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        Ok(self.conn.lock()?)
    }

    /// Run `f` inside one IMMEDIATE transaction. Commits on `Ok`, rolls back
    /// on `Err` (the transaction is dropped without commit).
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock().map_err(E::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(StoreError::from(e)))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
        Ok(value)
    }
}

/// Open the database file and apply pragmas. `busy_timeout` goes first so
/// switching the journal mode waits on other connections instead of failing.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn is_corruption(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the database and its WAL/SHM side files out of the way.
fn quarantine_file(db_path: &Path) -> Result<PathBuf, StoreError> {
    let suffix = format!("corrupt-{}", chrono::Utc::now().format("%Y%m%d%H%M%S"));
    let aside = db_path.with_extension(format!("db.{suffix}"));
    fs::rename(db_path, &aside)?;
    for side in ["db-wal", "db-shm"] {
        let path = db_path.with_extension(side);
        if path.exists() {
            fs::rename(&path, db_path.with_extension(format!("{side}.{suffix}")))?;
        }
    }
    Ok(aside)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

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

    Ok(())
}

/// Migration v1: orders, lines, payments, the mutation queue and metadata.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS orders (
            local_id TEXT PRIMARY KEY,
            server_id TEXT,
            order_number TEXT NOT NULL,
            order_type TEXT NOT NULL,
            table_id TEXT,
            shift_id TEXT NOT NULL,
            terminal_id TEXT NOT NULL,
            created_by_staff_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            subtotal_ugx INTEGER NOT NULL DEFAULT 0,
            tax_ugx INTEGER NOT NULL DEFAULT 0,
            total_ugx INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            is_offline_served INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_server_id ON orders(server_id);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);

        CREATE TABLE IF NOT EXISTS order_items (
            local_id TEXT PRIMARY KEY,
            server_id TEXT,
            order_local_id TEXT NOT NULL REFERENCES orders(local_id),
            order_server_id TEXT,
            product_id TEXT NOT NULL,
            product_name TEXT NOT NULL,
            unit_price_ugx INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            line_total_ugx INTEGER NOT NULL,
            size TEXT,
            modifier TEXT,
            notes TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_local_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_server_id ON order_items(server_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_sync_status ON order_items(sync_status);

        CREATE TABLE IF NOT EXISTS payments (
            local_id TEXT PRIMARY KEY,
            server_id TEXT,
            order_local_id TEXT NOT NULL REFERENCES orders(local_id),
            order_server_id TEXT,
            amount_ugx INTEGER NOT NULL,
            change_ugx INTEGER,
            method TEXT NOT NULL,
            created_by_staff_id TEXT NOT NULL,
            terminal_id TEXT NOT NULL,
            client_request_id TEXT NOT NULL UNIQUE,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payments_order ON payments(order_local_id);
        CREATE INDEX IF NOT EXISTS idx_payments_server_id ON payments(server_id);
        CREATE INDEX IF NOT EXISTS idx_payments_sync_status ON payments(sync_status);

        CREATE TABLE IF NOT EXISTS mutation_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mutation_type TEXT NOT NULL,
            entity_local_id TEXT NOT NULL,
            order_local_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            client_request_id TEXT NOT NULL UNIQUE,
            dependencies TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            failure_kind TEXT,
            error_code TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_mutation_queue_status ON mutation_queue(status);
        CREATE INDEX IF NOT EXISTS idx_mutation_queue_order ON mutation_queue(order_local_id);

        CREATE TABLE IF NOT EXISTS sync_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sync_at TEXT,
            pending_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        );
        INSERT OR IGNORE INTO sync_metadata (id) VALUES (1);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied migration v1 (orders, order_items, payments, mutation_queue)");
    Ok(())
}

/// Migration v2: local print/drawer spool fed by synced payments.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS print_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payment_local_id TEXT NOT NULL,
            payment_server_id TEXT,
            order_local_id TEXT NOT NULL,
            terminal_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(kind, payment_local_id)
        );
        CREATE INDEX IF NOT EXISTS idx_print_jobs_status ON print_jobs(status);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    info!("Applied migration v2 (print_jobs table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Local settings
// ---------------------------------------------------------------------------

pub fn get_setting(
    conn: &Connection,
    category: &str,
    key: &str,
) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync metadata
// ---------------------------------------------------------------------------

pub fn get_sync_metadata(conn: &Connection) -> Result<SyncMetadata, StoreError> {
    Ok(conn.query_row(
        "SELECT last_sync_at, pending_count, failed_count, updated_at
         FROM sync_metadata WHERE id = 1",
        [],
        |row| {
            Ok(SyncMetadata {
                last_sync_at: row.get(0)?,
                pending_count: row.get(1)?,
                failed_count: row.get(2)?,
                updated_at: row.get(3)?,
            })
        },
    )?)
}

/// Recompute the queue counters; stamp `last_sync_at` when `synced_any`.
pub fn refresh_sync_metadata(
    conn: &Connection,
    synced_any: bool,
) -> Result<SyncMetadata, StoreError> {
    let now = now_timestamp();
    conn.execute(
        "UPDATE sync_metadata SET
            pending_count = (SELECT COUNT(*) FROM mutation_queue
                             WHERE status IN ('pending', 'syncing')),
            failed_count = (SELECT COUNT(*) FROM mutation_queue WHERE status = 'failed'),
            last_sync_at = CASE WHEN ?1 THEN ?2 ELSE last_sync_at END,
            updated_at = ?2
         WHERE id = 1",
        params![synced_any, now],
    )?;
    get_sync_metadata(conn)
}

// ===========================================================================
// Tests
// ===========================================================================
