//! Embedded schema migrations
//!
//! Migrations are compiled into the binary, ordered by their numeric
//! prefix, applied inside a transaction, and recorded in
//! `_rift.schema_version` so each runs at most once.

use rift_common::{Result, RiftError};
use sqlx::{Executor, PgPool};
use tracing::info;

/// (version, filename, sql), sorted by version.
const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "001_init.sql",
    include_str!("../migrations/001_init.sql"),
)];

/// Apply unapplied migrations in order.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for &(version, filename, sql) in MIGRATIONS {
        if is_migration_applied(pool, version).await? {
            continue;
        }
        apply_migration(pool, version, filename, sql).await?;
        info!(version, filename, "applied migration");
    }
    Ok(())
}

/// Parse the version number out of a filename like "001_init.sql".
pub fn parse_migration_version(filename: &str) -> Result<i32> {
    let prefix = filename.split('_').next().unwrap_or("");
    prefix
        .parse()
        .map_err(|_| RiftError::Storage(format!("invalid migration filename: {}", filename)))
}

/// Whether a migration version has already been applied. Returns false when
/// the schema_version table does not exist yet (first run).
async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let table_exists: bool = sqlx::query_scalar(
        r#"SELECT EXISTS(
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = '_rift' AND table_name = 'schema_version'
        )"#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(false);
    }

    let applied: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM _rift.schema_version WHERE version = $1)")
            .bind(version)
            .fetch_one(pool)
            .await?;
    Ok(applied)
}

/// Execute a migration and record it, atomically.
async fn apply_migration(pool: &PgPool, version: i32, filename: &str, sql: &str) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| RiftError::Storage(format!("begin migration tx: {}", e)))?;

    // Simple-query execution: migration files may hold multiple statements
    (&mut *tx)
        .execute(sql)
        .await
        .map_err(|e| RiftError::Storage(format!("exec migration {}: {}", filename, e)))?;

    // The schema_version table is created by the first migration itself
    sqlx::query(
        "INSERT INTO _rift.schema_version (version, description) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(version)
    .bind(filename)
    .execute(&mut *tx)
    .await
    .map_err(|e| RiftError::Storage(format!("record migration {}: {}", filename, e)))?;

    tx.commit()
        .await
        .map_err(|e| RiftError::Storage(format!("commit migration {}: {}", filename, e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migration_version() {
        assert_eq!(parse_migration_version("001_init.sql").unwrap(), 1);
        assert_eq!(parse_migration_version("042_add_stats.sql").unwrap(), 42);
        assert!(parse_migration_version("init.sql").is_err());
    }

    #[test]
    fn test_migrations_sorted_and_unique() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_migration_filenames_match_versions() {
        for &(version, filename, sql) in MIGRATIONS {
            assert_eq!(parse_migration_version(filename).unwrap(), version);
            assert!(!sql.trim().is_empty());
        }
    }
}
