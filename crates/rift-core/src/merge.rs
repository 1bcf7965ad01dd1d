//! Merge SQL generation
//!
//! Produces the SQL that would propagate a branch's overlay changes into
//! the source table: tombstoned rows are deleted, surviving overlay rows
//! update their source counterparts, and the rest are inserted. The SQL is
//! generated for human review only; rift never executes it itself.

use crate::overlay::introspect_table;
use crate::rewriter::{build_pk_join, qualified_table, quote_idents};
use rift_common::{Result, RiftError};
use serde::Serialize;
use sqlx::PgPool;

/// Generated merge statements for one table, including the BEGIN/COMMIT
/// framing.
#[derive(Debug, Clone, Serialize)]
pub struct MergeSql {
    pub table_name: String,
    pub statements: Vec<String>,
}

/// Generate the merge SQL for one table.
pub async fn generate_merge_sql(
    pool: &PgPool,
    branch_schema: &str,
    source_schema: &str,
    table: &str,
    pk_cols: &[String],
) -> Result<MergeSql> {
    if pk_cols.is_empty() {
        return Err(RiftError::MissingPrimaryKey(table.to_string()));
    }

    let ovr_table = qualified_table(branch_schema, table);
    let src_table = qualified_table(source_schema, table);

    let cols = introspect_table(pool, source_schema, table).await?;
    let col_names: Vec<String> = cols.iter().map(|c| c.name.clone()).collect();
    let quoted_cols = quote_idents(&col_names);

    let pk_join = build_pk_join("ovr", "src", pk_cols);

    let mut statements = vec!["BEGIN".to_string()];

    // Step 1: delete rows tombstoned in the branch
    statements.push(format!(
        "DELETE FROM {} src WHERE EXISTS (SELECT 1 FROM {} ovr WHERE {} AND ovr._rift_tombstone)",
        src_table, ovr_table, pk_join
    ));

    // Step 2: update rows that exist on both sides
    let set_clauses: Vec<String> = quoted_cols
        .iter()
        .map(|col| format!("{} = ovr.{}", col, col))
        .collect();
    statements.push(format!(
        "UPDATE {} src SET {} FROM {} ovr WHERE {} AND NOT ovr._rift_tombstone",
        src_table,
        set_clauses.join(", "),
        ovr_table,
        pk_join
    ));

    // Step 3: insert rows new to the branch
    let col_list = quoted_cols.join(", ");
    let ovr_col_list: Vec<String> = quoted_cols.iter().map(|col| format!("ovr.{}", col)).collect();
    let pk_join_for_insert = build_pk_join("src", "ovr", pk_cols);
    statements.push(format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} ovr WHERE NOT ovr._rift_tombstone AND NOT EXISTS (SELECT 1 FROM {} src WHERE {})",
        src_table,
        col_list,
        ovr_col_list.join(", "),
        ovr_table,
        src_table,
        pk_join_for_insert
    ));

    statements.push("COMMIT".to_string());

    Ok(MergeSql {
        table_name: table.to_string(),
        statements,
    })
}

/// Render the merge statements as a single executable script.
pub fn format_merge_sql(merge: &MergeSql) -> String {
    format!("{};", merge.statements.join(";\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_merge_sql() {
        let merge = MergeSql {
            table_name: "users".into(),
            statements: vec![
                "BEGIN".into(),
                "DELETE FROM x".into(),
                "COMMIT".into(),
            ],
        };
        assert_eq!(format_merge_sql(&merge), "BEGIN;\nDELETE FROM x;\nCOMMIT;");
    }
}
