//! SQLite persistence.
//!
//! The database is both the sink for scan results and the feed for the
//! database-driven ingress mode: `domains.mx_hosts` records which mail
//! exchangers each domain announced, and
//! [`fetch_mx_hostnames`] drains them back out for scanning.

mod migrations;
mod sink;

pub use migrations::run_migrations;
pub use sink::{Artifact, ResultSink, SinkStats};

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use log::{error, info};
use sqlx::SqlitePool;

use crate::error_handling::DatabaseError;

/// Initializes and returns a database connection pool.
///
/// Creates the database file if it doesn't exist and enables WAL mode for
/// concurrent access from the worker pools.
pub async fn init_db_pool(db_path: &Path) -> Result<Arc<SqlitePool>, DatabaseError> {
    let db_path_str = db_path.to_string_lossy().to_string();
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&db_path_str)
    {
        Ok(_) => info!("Database file created successfully."),
        Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {
            info!("Database file already exists.")
        }
        Err(e) => {
            error!("Failed to create database file: {e}");
            return Err(DatabaseError::FileCreationError(e.to_string()));
        }
    }

    let pool = SqlitePool::connect(&format!("sqlite:{}", db_path_str))
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {e}");
            DatabaseError::SqlError(e)
        })?;

    // Enable WAL mode
    sqlx::query("PRAGMA journal_mode=WAL")
        .execute(&pool)
        .await
        .map_err(|e| {
            error!("Failed to set WAL mode: {e}");
            DatabaseError::SqlError(e)
        })?;

    Ok(Arc::new(pool))
}

/// The distinct mail exchanger hostnames recorded in the domains table, in
/// first-seen order.
pub async fn fetch_mx_hostnames(pool: &SqlitePool) -> Result<Vec<String>, DatabaseError> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT mx_hosts FROM domains WHERE mx_hosts IS NOT NULL ORDER BY id")
            .fetch_all(pool)
            .await?;

    let mut seen = HashSet::new();
    let mut hostnames = Vec::new();
    for row in rows {
        let Ok(hosts) = serde_json::from_str::<Vec<String>>(&row) else {
            continue;
        };
        for host in hosts {
            if seen.insert(host.clone()) {
                hostnames.push(host);
            }
        }
    }
    Ok(hostnames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_mx_hostnames_flattens_and_dedupes() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO domains (name, mx_hosts) VALUES (?, ?)")
            .bind("a.example")
            .bind(r#"["mx1.example.com","mx2.example.com"]"#)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO domains (name, mx_hosts) VALUES (?, ?)")
            .bind("b.example")
            .bind(r#"["mx2.example.com","mx3.example.com"]"#)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO domains (name) VALUES ('c.example')")
            .execute(&pool)
            .await
            .unwrap();

        let hostnames = fetch_mx_hostnames(&pool).await.unwrap();
        assert_eq!(
            hostnames,
            vec!["mx1.example.com", "mx2.example.com", "mx3.example.com"]
        );
    }
}
