//! Database schema management.
//!
//! Creates all tables on startup. Natural keys (domain name, hostname plus
//! address, certificate SHA-1, address, mx-domain name) carry UNIQUE
//! constraints so that repeated runs and concurrent writers stay idempotent.

use sqlx::SqlitePool;

use crate::error_handling::DatabaseError;

/// Creates the schema if it does not exist yet.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DatabaseError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS domains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            mx_hosts TEXT,
            dns_secure INTEGER NOT NULL DEFAULT 0,
            dns_error TEXT,
            dns_bogus TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mx_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hostname TEXT NOT NULL,
            address TEXT NOT NULL,
            family INTEGER NOT NULL,
            dns_secure INTEGER NOT NULL DEFAULT 0,
            dns_error TEXT,
            dns_bogus TEXT,
            UNIQUE(hostname, address)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_mx_records_hostname_family
         ON mx_records(hostname, family)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS raw_certificates (
            id BLOB PRIMARY KEY,
            raw BLOB NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS certificates (
            id BLOB PRIMARY KEY,
            subject_id BLOB NOT NULL,
            issuer_id BLOB NOT NULL,
            key_id BLOB NOT NULL,
            signature_algorithm TEXT,
            key_algorithm TEXT,
            is_self_signed INTEGER NOT NULL,
            is_ca INTEGER NOT NULL,
            first_seen_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mx_hosts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            error TEXT,
            starttls INTEGER,
            tls_versions TEXT,
            tls_cipher_suites TEXT,
            certificate_id BLOB,
            ca_certificate_ids TEXT,
            cert_expired INTEGER,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mx_domains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            txt TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
