//! Metadata store
//!
//! All branch metadata lives in the `_rift` schema of the upstream
//! database: branches, tracked tables, the primary-key cache, and the
//! migration ledger. The store also owns the shared connection pool that
//! sessions borrow from.

use crate::migrate::run_migrations;
use crate::rewriter::quote_ident;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rift_common::{Result, RiftError};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

static BRANCH_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("branch name regex"));

/// Branch metadata stored in _rift.branches.
#[derive(Debug, Clone, Default)]
pub struct Branch {
    pub name: String,
    pub parent: String,
    pub database: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_seconds: Option<i64>,
    pub pinned: bool,
    pub delta_size: i64,
    pub rows_changed: i64,
    pub status: String,
}

/// An overlay table entry in _rift.branch_tables.
#[derive(Debug, Clone, Default)]
pub struct TrackedTable {
    pub branch_name: String,
    pub source_schema: String,
    pub table_name: String,
    pub overlay_table: String,
    pub has_tombstones: bool,
    pub row_count: i64,
}

/// A column in a table's primary key.
#[derive(Debug, Clone)]
pub struct PrimaryKeyColumn {
    pub source_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub ordinal: i32,
}

/// PostgreSQL-backed metadata store.
pub struct MetaStore {
    pool: PgPool,
}

impl MetaStore {
    /// Connect to the upstream and verify it responds.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect(url)
            .await
            .map_err(|e| RiftError::UpstreamUnavailable(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| RiftError::UpstreamUnavailable(e.to_string()))?;

        info!("connected to upstream");
        Ok(Self { pool })
    }

    /// Run migrations and ensure the _rift schema exists.
    pub async fn init(&self) -> Result<()> {
        run_migrations(&self.pool).await
    }

    /// Stamp the main branch with the upstream database name. Called once
    /// at init; the seed migration leaves the name empty.
    pub async fn stamp_main_database(&self, database: &str) -> Result<()> {
        sqlx::query("UPDATE _rift.branches SET database = $1 WHERE name = 'main' AND database = ''")
            .bind(database)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- Branch CRUD ---

    pub async fn create_branch(&self, b: &Branch) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO _rift.branches
               (name, parent, database, created_at, updated_at, ttl_seconds, pinned, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(&b.name)
        .bind(null_if_empty(&b.parent))
        .bind(&b.database)
        .bind(b.created_at)
        .bind(b.updated_at)
        .bind(b.ttl_seconds)
        .bind(b.pinned)
        .bind(&b.status)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RiftError::BranchExists(b.name.clone())
            }
            _ => e.into(),
        })?;
        Ok(())
    }

    pub async fn get_branch(&self, name: &str) -> Result<Branch> {
        let row = sqlx::query(
            r#"SELECT name, parent, database, created_at, updated_at, ttl_seconds,
                      pinned, delta_size, rows_changed, status
               FROM _rift.branches WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(branch_from_row(&row)),
            None => Err(RiftError::BranchNotFound(name.to_string())),
        }
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        let rows = sqlx::query(
            r#"SELECT name, parent, database, created_at, updated_at, ttl_seconds,
                      pinned, delta_size, rows_changed, status
               FROM _rift.branches ORDER BY created_at"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(branch_from_row).collect())
    }

    pub async fn update_branch(&self, b: &Branch) -> Result<()> {
        sqlx::query(
            r#"UPDATE _rift.branches SET parent=$2, database=$3, updated_at=$4, ttl_seconds=$5,
               pinned=$6, delta_size=$7, rows_changed=$8, status=$9
               WHERE name=$1"#,
        )
        .bind(&b.name)
        .bind(null_if_empty(&b.parent))
        .bind(&b.database)
        .bind(Utc::now())
        .bind(b.ttl_seconds)
        .bind(b.pinned)
        .bind(b.delta_size)
        .bind(b.rows_changed)
        .bind(&b.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM _rift.branches WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RiftError::BranchNotFound(name.to_string()));
        }
        Ok(())
    }

    // --- Branch overlay schema ---

    /// Create the _rift_branch_<name> schema.
    pub async fn create_branch_schema(&self, branch_name: &str) -> Result<()> {
        let schema = branch_schema_name(branch_name);
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop the _rift_branch_<name> schema and everything in it.
    pub async fn drop_branch_schema(&self, branch_name: &str) -> Result<()> {
        let schema = branch_schema_name(branch_name);
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&schema));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    // --- Table tracking ---

    pub async fn track_table(&self, t: &TrackedTable) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO _rift.branch_tables
               (branch_name, source_schema, table_name, overlay_table, has_tombstones)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (branch_name, source_schema, table_name) DO NOTHING"#,
        )
        .bind(&t.branch_name)
        .bind(&t.source_schema)
        .bind(&t.table_name)
        .bind(&t.overlay_table)
        .bind(t.has_tombstones)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn untrack_table(
        &self,
        branch_name: &str,
        source_schema: &str,
        table_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM _rift.branch_tables WHERE branch_name=$1 AND source_schema=$2 AND table_name=$3",
        )
        .bind(branch_name)
        .bind(source_schema)
        .bind(table_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_tracked_tables(&self, branch_name: &str) -> Result<Vec<TrackedTable>> {
        let rows = sqlx::query(
            r#"SELECT branch_name, source_schema, table_name, overlay_table, has_tombstones, row_count
               FROM _rift.branch_tables WHERE branch_name = $1 ORDER BY table_name"#,
        )
        .bind(branch_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TrackedTable {
                branch_name: row.get("branch_name"),
                source_schema: row.get("source_schema"),
                table_name: row.get("table_name"),
                overlay_table: row.get("overlay_table"),
                has_tombstones: row.get("has_tombstones"),
                row_count: row.get("row_count"),
            })
            .collect())
    }

    pub async fn update_tracked_row_count(
        &self,
        branch_name: &str,
        source_schema: &str,
        table_name: &str,
        row_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE _rift.branch_tables SET row_count=$4 WHERE branch_name=$1 AND source_schema=$2 AND table_name=$3",
        )
        .bind(branch_name)
        .bind(source_schema)
        .bind(table_name)
        .bind(row_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Primary key cache ---

    pub async fn cache_primary_keys(&self, keys: &[PrimaryKeyColumn]) -> Result<()> {
        for k in keys {
            sqlx::query(
                r#"INSERT INTO _rift.table_primary_keys (source_schema, table_name, column_name, ordinal)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (source_schema, table_name, column_name) DO UPDATE SET ordinal = $4"#,
            )
            .bind(&k.source_schema)
            .bind(&k.table_name)
            .bind(&k.column_name)
            .bind(k.ordinal)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn get_primary_keys(
        &self,
        source_schema: &str,
        table_name: &str,
    ) -> Result<Vec<PrimaryKeyColumn>> {
        let rows = sqlx::query(
            r#"SELECT source_schema, table_name, column_name, ordinal
               FROM _rift.table_primary_keys
               WHERE source_schema=$1 AND table_name=$2
               ORDER BY ordinal"#,
        )
        .bind(source_schema)
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PrimaryKeyColumn {
                source_schema: row.get("source_schema"),
                table_name: row.get("table_name"),
                column_name: row.get("column_name"),
                ordinal: row.get("ordinal"),
            })
            .collect())
    }
}

fn branch_from_row(row: &sqlx::postgres::PgRow) -> Branch {
    Branch {
        name: row.get("name"),
        parent: row.get::<Option<String>, _>("parent").unwrap_or_default(),
        database: row.get("database"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        ttl_seconds: row.get("ttl_seconds"),
        pinned: row.get("pinned"),
        delta_size: row.get("delta_size"),
        rows_changed: row.get("rows_changed"),
        status: row.get("status"),
    }
}

fn null_if_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Overlay schema name for a branch: sanitized and prefixed.
pub fn branch_schema_name(branch_name: &str) -> String {
    format!("_rift_branch_{}", sanitize_branch_name(branch_name))
}

fn sanitize_branch_name(name: &str) -> String {
    name.to_lowercase()
        .replace(['-', '.', '/'], "_")
}

/// Validate that a branch name is safe for use as a schema suffix.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RiftError::InvalidBranchName(
            "branch name cannot be empty".into(),
        ));
    }
    if name.len() > 63 {
        return Err(RiftError::InvalidBranchName(
            "branch name too long (max 63 characters)".into(),
        ));
    }
    if !BRANCH_NAME_RE.is_match(name) {
        return Err(RiftError::InvalidBranchName(
            "branch name must contain only alphanumeric characters, hyphens, and underscores"
                .into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_branch_name() {
        assert!(validate_branch_name("dev").is_ok());
        assert!(validate_branch_name("feature-123").is_ok());
        assert!(validate_branch_name("a_b-c9").is_ok());

        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("-leading-dash").is_err());
        assert!(validate_branch_name("_leading_underscore").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("has;semicolon").is_err());
    }

    #[test]
    fn test_validate_branch_name_length_boundary() {
        let exactly_63 = "a".repeat(63);
        assert!(validate_branch_name(&exactly_63).is_ok());

        let too_long = "a".repeat(64);
        let err = validate_branch_name(&too_long).unwrap_err();
        assert!(matches!(err, RiftError::InvalidBranchName(_)));
    }

    #[test]
    fn test_branch_schema_name() {
        assert_eq!(branch_schema_name("dev"), "_rift_branch_dev");
        assert_eq!(branch_schema_name("My.Feature"), "_rift_branch_my_feature");
        assert_eq!(branch_schema_name("a-b/c"), "_rift_branch_a_b_c");
    }

    #[test]
    fn test_branch_schema_name_stable() {
        // Sanitization is deterministic
        assert_eq!(
            branch_schema_name("Feature-X"),
            branch_schema_name("Feature-X")
        );
    }

    #[test]
    fn test_null_if_empty() {
        assert_eq!(null_if_empty(""), None);
        assert_eq!(null_if_empty("main"), Some("main"));
    }
}
