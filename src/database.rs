//! SQLite pool construction and schema migrations.
//!
//! The cache lives in a single database file in the working directory and is
//! migrated on startup. Statements are idempotent so a restart against an
//! existing file is a no-op.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!(path, "connected to cache database");
    Ok(pool)
}

/// In-memory database for tests. A single connection keeps the schema alive
/// for the pool's lifetime.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id  TEXT PRIMARY KEY,
        uri TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS virtual_machines (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id       TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        name          TEXT NOT NULL,
        internal_uuid TEXT NOT NULL UNIQUE,
        domain_uuid   TEXT NOT NULL,
        description   TEXT NOT NULL DEFAULT '',
        state         TEXT NOT NULL,
        vcpu_count    INTEGER NOT NULL,
        memory_bytes  INTEGER NOT NULL,
        UNIQUE (host_id, domain_uuid),
        UNIQUE (host_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volumes (
        id     INTEGER PRIMARY KEY AUTOINCREMENT,
        path   TEXT NOT NULL UNIQUE,
        format TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volume_attachments (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id       INTEGER NOT NULL REFERENCES virtual_machines(id) ON DELETE CASCADE,
        volume_id   INTEGER NOT NULL REFERENCES volumes(id),
        device_name TEXT NOT NULL,
        bus_type    TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS networks (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id     TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        uuid        TEXT NOT NULL UNIQUE,
        bridge_name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ports (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id       INTEGER NOT NULL REFERENCES virtual_machines(id) ON DELETE CASCADE,
        mac_address TEXT NOT NULL UNIQUE,
        model_name  TEXT NOT NULL DEFAULT '',
        device_name TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS port_bindings (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        port_id    INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
        network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
        UNIQUE (port_id, network_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graphics_devices (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graphics_device_attachments (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id              INTEGER NOT NULL REFERENCES virtual_machines(id) ON DELETE CASCADE,
        graphics_device_id INTEGER NOT NULL REFERENCES graphics_devices(id)
    )
    "#,
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
