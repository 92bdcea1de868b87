//! Database schema and its versioning.

use rusqlite::Connection;
use tracing::{debug, info};

/// Schema version written after the last migration.
pub(super) const SCHEMA_VERSION: i32 = 1;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS Accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        provider TEXT,
        enabled INTEGER);

    CREATE TABLE IF NOT EXISTS Services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        display TEXT NOT NULL,
        provider TEXT,
        type TEXT);
    CREATE INDEX IF NOT EXISTS idx_service ON Services(name);

    CREATE TABLE IF NOT EXISTS Settings (
        account INTEGER NOT NULL,
        service INTEGER,
        key TEXT NOT NULL,
        type TEXT NOT NULL,
        value BLOB);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_setting ON Settings (account, service, key);

    CREATE TRIGGER IF NOT EXISTS tg_delete_account
        BEFORE DELETE ON Accounts FOR EACH ROW BEGIN
            DELETE FROM Settings WHERE account = OLD.id;
        END;

    CREATE TABLE IF NOT EXISTS Signatures (
        account INTEGER NOT NULL,
        service INTEGER,
        key TEXT NOT NULL,
        signature TEXT NOT NULL,
        token TEXT NOT NULL);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_signatures ON Signatures (account, service, key);
";

/// Reads the schema version stored in the database header.
pub(super) fn version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Run all schema migrations, if needed.
pub(super) fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    run_migration(conn, 1, migration_001_create_tables)?;
    Ok(())
}

fn run_migration<F>(conn: &Connection, target: i32, f: F) -> rusqlite::Result<()>
where
    F: Fn(&Connection) -> rusqlite::Result<()>,
{
    let name = std::any::type_name::<F>();
    let name = name.rsplit("::").next().unwrap_or(name);
    if version(conn)? >= target {
        debug!("Skip migration {name}: Not needed");
        return Ok(());
    }
    conn.execute_batch("BEGIN EXCLUSIVE")?;
    match migrate_locked(conn, target, &f) {
        Ok(executed) => {
            conn.execute_batch("COMMIT")?;
            if executed {
                info!("Executed migration {name}");
            } else {
                debug!("Skip migration {name}: Not needed");
            }
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn migrate_locked<F>(conn: &Connection, target: i32, f: &F) -> rusqlite::Result<bool>
where
    F: Fn(&Connection) -> rusqlite::Result<()>,
{
    // another process may have migrated while we waited for the lock
    if version(conn)? >= target {
        return Ok(false);
    }
    f(conn)?;
    conn.pragma_update(None, "user_version", target)?;
    Ok(true)
}

/// migration 001: create the initial tables
fn migration_001_create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)
}
