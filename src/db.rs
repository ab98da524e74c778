//! SQLite pool setup shared by the local object store and the SQLite
//! metastore. The schema is embedded and applied statement by statement.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

/// Open (creating if needed) a SQLite database at `url`.
///
/// In-memory databases are limited to a single connection; every extra
/// connection to `sqlite::memory:` would otherwise see its own empty
/// database.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = url.contains(":memory:");
    if !in_memory {
        let db_path = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let max_connections = if in_memory { 1 } else { 5 };
    debug!("Connecting to {} with {} connections", url, max_connections);
    let mut pool = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // Recycling the only connection would drop the database with it.
        pool = pool.idle_timeout(None).max_lifetime(None);
    }
    pool.connect_with(options).await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Connect and migrate in one step.
pub async fn open(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let db = connect(url).await?;
    run_migrations(&db).await?;
    Ok(db)
}
