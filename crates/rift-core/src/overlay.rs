//! Overlay (shadow) table management
//!
//! Shadow tables live in the branch schema, mirror the source table's
//! structure plus a `_rift_tombstone` column, and carry the source's
//! primary key. The source table is never touched here.

use crate::rewriter::{quote_ident, quote_idents};
use rift_common::{Result, RiftError};
use sqlx::{PgPool, Row};
use tracing::debug;

/// A column in a table, as reported by information_schema.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_pk: bool,
    pub ordinal: i32,
    pub default: String,
}

/// Create the overlay table for a source table if it does not exist yet.
/// Structure is copied with LIKE (defaults and constraints included), the
/// tombstone column is added, and the source PK is re-added when LIKE did
/// not carry it over.
pub async fn ensure_overlay_table(
    pool: &PgPool,
    branch_schema: &str,
    source_schema: &str,
    table: &str,
) -> Result<()> {
    if table_exists(pool, branch_schema, table).await? {
        return Ok(());
    }

    let pk_cols = get_table_primary_keys(pool, source_schema, table).await?;
    if pk_cols.is_empty() {
        return Err(RiftError::MissingPrimaryKey(format!(
            "{}.{}",
            source_schema, table
        )));
    }

    let overlay_table = format!("{}.{}", quote_ident(branch_schema), quote_ident(table));
    let source_table = format!("{}.{}", quote_ident(source_schema), quote_ident(table));

    let create_sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS)",
        overlay_table, source_table
    );
    sqlx::query(&create_sql)
        .execute(pool)
        .await
        .map_err(|e| storage_err("create overlay table", e))?;

    let add_tombstone = format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS _rift_tombstone BOOLEAN NOT NULL DEFAULT false",
        overlay_table
    );
    sqlx::query(&add_tombstone)
        .execute(pool)
        .await
        .map_err(|e| storage_err("add tombstone column", e))?;

    // LIKE may or may not copy the PK constraint depending on the server
    // version; re-add it from the source definition if absent.
    let has_pk: bool = sqlx::query_scalar(
        r#"SELECT EXISTS (
            SELECT 1 FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class r ON r.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = r.relnamespace
            WHERE n.nspname = $1 AND r.relname = $2 AND c.contype = 'p'
        )"#,
    )
    .bind(branch_schema)
    .bind(table)
    .fetch_one(pool)
    .await
    .map_err(|e| storage_err("check overlay PK", e))?;

    if !has_pk {
        let pk_list = quote_idents(&pk_cols).join(", ");
        let add_pk = format!("ALTER TABLE {} ADD PRIMARY KEY ({})", overlay_table, pk_list);
        sqlx::query(&add_pk)
            .execute(pool)
            .await
            .map_err(|e| storage_err("add overlay PK", e))?;
    }

    debug!(branch_schema, source_schema, table, "created overlay table");
    Ok(())
}

/// Drop an overlay table if it exists.
pub async fn drop_overlay_table(pool: &PgPool, branch_schema: &str, table: &str) -> Result<()> {
    let sql = format!(
        "DROP TABLE IF EXISTS {}.{}",
        quote_ident(branch_schema),
        quote_ident(table)
    );
    sqlx::query(&sql)
        .execute(pool)
        .await
        .map_err(|e| storage_err("drop overlay table", e))?;
    Ok(())
}

/// Count of non-tombstone rows in an overlay table.
pub async fn overlay_row_count(pool: &PgPool, branch_schema: &str, table: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.{} WHERE NOT _rift_tombstone",
        quote_ident(branch_schema),
        quote_ident(table)
    );
    sqlx::query_scalar(&sql)
        .fetch_one(pool)
        .await
        .map_err(|e| storage_err("count overlay rows", e))
}

/// Count of tombstone rows in an overlay table.
pub async fn tombstone_count(pool: &PgPool, branch_schema: &str, table: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.{} WHERE _rift_tombstone",
        quote_ident(branch_schema),
        quote_ident(table)
    );
    sqlx::query_scalar(&sql)
        .fetch_one(pool)
        .await
        .map_err(|e| storage_err("count tombstones", e))
}

/// Whether a table exists in the given schema.
pub async fn table_exists(pool: &PgPool, schema: &str, table: &str) -> Result<bool> {
    sqlx::query_scalar(
        r#"SELECT EXISTS(
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )"#,
    )
    .bind(schema)
    .bind(table)
    .fetch_one(pool)
    .await
    .map_err(|e| storage_err("check table exists", e))
}

/// Primary key column names of a table, in ordinal order.
pub async fn get_table_primary_keys(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"SELECT kcu.column_name
           FROM information_schema.table_constraints tc
           JOIN information_schema.key_column_usage kcu
             ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
           WHERE tc.constraint_type = 'PRIMARY KEY'
             AND tc.table_schema = $1
             AND tc.table_name = $2
           ORDER BY kcu.ordinal_position"#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| storage_err("get primary keys", e))?;

    Ok(rows
        .iter()
        .map(|row| row.get::<String, _>("column_name"))
        .collect())
}

/// Column definitions of a table, enriched with PK membership.
pub async fn introspect_table(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<ColumnDef>> {
    let rows = sqlx::query(
        r#"SELECT c.column_name, c.data_type, c.is_nullable = 'YES' AS nullable,
                  c.ordinal_position, COALESCE(c.column_default, '') AS col_default
           FROM information_schema.columns c
           WHERE c.table_schema = $1 AND c.table_name = $2
           ORDER BY c.ordinal_position"#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| storage_err("introspect columns", e))?;

    if rows.is_empty() {
        return Err(RiftError::UnknownTable(format!("{}.{}", schema, table)));
    }

    let pk_cols = get_table_primary_keys(pool, schema, table).await?;

    let cols = rows
        .iter()
        .map(|row| {
            let name: String = row.get("column_name");
            let is_pk = pk_cols.contains(&name);
            ColumnDef {
                name,
                data_type: row.get("data_type"),
                is_nullable: row.get("nullable"),
                is_pk,
                ordinal: row.get("ordinal_position"),
                default: row.get("col_default"),
            }
        })
        .collect();

    Ok(cols)
}

pub(crate) fn storage_err(op: &str, err: sqlx::Error) -> RiftError {
    RiftError::Storage(format!("{}: {}", op, err))
}
