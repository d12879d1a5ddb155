//! Local SQLite database layer for the laundromat terminal.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations for the five
//! record collections, the `local_settings` key/value table, and the shared
//! connection state used by the store.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::StoreError;

/// Database connection shared by the store and the settings helpers.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "laundromat.db";

/// Initialize the database at `{data_dir}/laundromat.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure the file
/// is moved aside (never deleted, it may hold unsynced sales) and the open
/// is retried once.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Unavailable(format!("create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_migrate(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving it aside and retrying once",
                first_err
            );
            quarantine_db_files(&db_path);
            open_and_migrate(&db_path).map_err(|e| {
                StoreError::Unavailable(format!("database open failed after retry: {e}"))
            })?
        }
    };

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema.
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

fn open_and_migrate(path: &Path) -> Result<Connection, StoreError> {
    let conn = open_and_configure(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Rename the database and its WAL/SHM side files to `*.corrupt-{ms}`.
fn quarantine_db_files(db_path: &Path) {
    let stamp = chrono::Utc::now().timestamp_millis();
    for suffix in ["", "-wal", "-shm"] {
        let file_name = format!("{DB_FILE_NAME}{suffix}");
        let path = db_path.with_file_name(&file_name);
        if !path.exists() {
            continue;
        }
        let target = db_path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
        match fs::rename(&path, &target) {
            Ok(()) => warn!(
                "Moved unreadable database file {} to {}",
                path.display(),
                target.display()
            ),
            Err(e) => error!("Failed to move {} aside: {e}", path.display()),
        }
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

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

    Ok(())
}

/// Migration v1: the five record collections and local settings.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- employee_profiles (remote-authoritative cache)
        CREATE TABLE IF NOT EXISTS employee_profiles (
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT 'employee',
            synced INTEGER NOT NULL DEFAULT 1
        );

        -- inventory_records (append-only history; NULL session_id = master template)
        CREATE TABLE IF NOT EXISTS inventory_records (
            id TEXT PRIMARY KEY,
            item_name TEXT NOT NULL,
            session_id TEXT,
            quantity INTEGER NOT NULL DEFAULT 0,
            unit_price REAL NOT NULL DEFAULT 0,
            start_count INTEGER NOT NULL DEFAULT 0,
            add_count INTEGER NOT NULL DEFAULT 0,
            sold_count INTEGER NOT NULL DEFAULT 0,
            left_count INTEGER NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- tickets
        CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            ticket_number TEXT NOT NULL,
            session_id TEXT NOT NULL,
            wash_amount REAL NOT NULL DEFAULT 0,
            dry_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- sessions (one employee shift per day)
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            employee_id TEXT NOT NULL,
            session_date TEXT NOT NULL,
            cash_started REAL NOT NULL DEFAULT 0,
            cash_added REAL NOT NULL DEFAULT 0,
            cash_total REAL NOT NULL DEFAULT 0,
            inventory_total REAL NOT NULL DEFAULT 0,
            wash_dry_total REAL NOT NULL DEFAULT 0,
            grand_total REAL NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- timesheets
        CREATE TABLE IF NOT EXISTS timesheets (
            id TEXT PRIMARY KEY,
            employee_id TEXT NOT NULL,
            clock_in_time TEXT NOT NULL,
            clock_out_time TEXT,
            work_duration REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );

        -- Sync-flag indexes
        CREATE INDEX IF NOT EXISTS idx_employee_profiles_synced ON employee_profiles(synced);
        CREATE INDEX IF NOT EXISTS idx_inventory_records_synced ON inventory_records(synced);
        CREATE INDEX IF NOT EXISTS idx_tickets_synced ON tickets(synced);
        CREATE INDEX IF NOT EXISTS idx_sessions_synced ON sessions(synced);
        CREATE INDEX IF NOT EXISTS idx_timesheets_synced ON timesheets(synced);

        CREATE INDEX IF NOT EXISTS idx_inventory_records_session ON inventory_records(session_id);
        CREATE INDEX IF NOT EXISTS idx_tickets_session ON tickets(session_id);
        CREATE INDEX IF NOT EXISTS idx_timesheets_employee ON timesheets(employee_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK");
        StoreError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: at most one open session per (employee, date).
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_per_day
            ON sessions(employee_id, session_date)
            WHERE status != 'completed';

        CREATE INDEX IF NOT EXISTS idx_inventory_records_item
            ON inventory_records(lower(trim(item_name)));

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK");
        StoreError::from(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
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

// ===========================================================================
// Tests
// ===========================================================================
