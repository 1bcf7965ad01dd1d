//! Branch diff
//!
//! Compares overlay tables against their sources by primary key:
//! tombstones are deletes, non-tombstone rows missing from the source are
//! inserts, the rest are updates. Column values are not compared; a no-op
//! UPDATE still counts as an update.

use crate::overlay::storage_err;
use crate::rewriter::{build_pk_join, qualified_table};
use rift_common::Result;
use serde::Serialize;
use sqlx::PgPool;

/// Changes for a single table in a branch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableDiff {
    pub table_name: String,
    pub source_schema: String,
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
}

/// Diff for an entire branch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BranchDiff {
    pub branch_name: String,
    pub parent: String,
    pub tables: Vec<TableDiff>,
}

impl BranchDiff {
    /// Sum of all changes across all tables.
    pub fn total_changes(&self) -> i64 {
        self.tables
            .iter()
            .map(|t| t.inserts + t.updates + t.deletes)
            .sum()
    }
}

/// Compute the diff between a branch overlay table and its source.
pub async fn diff_table(
    pool: &PgPool,
    branch_schema: &str,
    source_schema: &str,
    table: &str,
    pk_cols: &[String],
) -> Result<TableDiff> {
    let ovr_table = qualified_table(branch_schema, table);
    let src_table = qualified_table(source_schema, table);
    let pk_join = build_pk_join("ovr", "src", pk_cols);

    let mut diff = TableDiff {
        table_name: table.to_string(),
        source_schema: source_schema.to_string(),
        ..Default::default()
    };

    let deletes_sql = format!("SELECT COUNT(*) FROM {} WHERE _rift_tombstone", ovr_table);
    diff.deletes = sqlx::query_scalar(&deletes_sql)
        .fetch_one(pool)
        .await
        .map_err(|e| storage_err("count deletes", e))?;

    let inserts_sql = format!(
        "SELECT COUNT(*) FROM {} ovr WHERE NOT ovr._rift_tombstone AND NOT EXISTS (SELECT 1 FROM {} src WHERE {})",
        ovr_table, src_table, pk_join
    );
    diff.inserts = sqlx::query_scalar(&inserts_sql)
        .fetch_one(pool)
        .await
        .map_err(|e| storage_err("count inserts", e))?;

    let updates_sql = format!(
        "SELECT COUNT(*) FROM {} ovr WHERE NOT ovr._rift_tombstone AND EXISTS (SELECT 1 FROM {} src WHERE {})",
        ovr_table, src_table, pk_join
    );
    diff.updates = sqlx::query_scalar(&updates_sql)
        .fetch_one(pool)
        .await
        .map_err(|e| storage_err("count updates", e))?;

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_changes() {
        let diff = BranchDiff {
            branch_name: "dev".into(),
            parent: "main".into(),
            tables: vec![
                TableDiff {
                    table_name: "users".into(),
                    source_schema: "public".into(),
                    inserts: 1,
                    updates: 2,
                    deletes: 3,
                },
                TableDiff {
                    table_name: "orders".into(),
                    source_schema: "public".into(),
                    inserts: 4,
                    updates: 0,
                    deletes: 0,
                },
            ],
        };
        assert_eq!(diff.total_changes(), 10);
    }

    #[test]
    fn test_total_changes_empty() {
        let diff = BranchDiff::default();
        assert_eq!(diff.total_changes(), 0);
        assert!(diff.tables.is_empty());
    }
}
