//! Copy-on-write query rewriting
//!
//! Rewrites a parsed statement so that reads see a union of overlay and
//! source rows (tombstones filtered), writes land in the overlay, and
//! deletes become tombstones. Table references are substituted textually
//! with word-boundary checks; schema-qualified references are matched as a
//! whole first.

use crate::analyzer::{ParsedQuery, QueryKind, TableRef};
use rift_common::{Result, RiftError};
use std::collections::HashMap;

/// Per-table information needed to rewrite a query for a branch.
#[derive(Debug, Clone, Default)]
pub struct RewriteConfig {
    /// e.g. "_rift_branch_dev"
    pub branch_schema: String,
    /// e.g. "public"
    pub source_schema: String,
    /// Primary key columns of the target table
    pub pk_columns: Vec<String>,
}

/// Rewritten SQL and metadata.
#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    pub sql: String,
    pub is_passthrough: bool,
    pub needs_overlay: bool,
    pub table_name: String,
}

impl RewriteResult {
    fn passthrough(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            is_passthrough: true,
            ..Default::default()
        }
    }
}

/// Rewrite a parsed query for execution against a branch overlay.
pub fn rewrite_for_branch(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    match pq.kind {
        QueryKind::Select => rewrite_select(pq, configs),
        QueryKind::Insert => rewrite_insert(pq, configs),
        QueryKind::Update => rewrite_update(pq, configs),
        QueryKind::Delete => rewrite_delete(pq, configs),
        QueryKind::Ddl => rewrite_ddl(pq, configs),
        // Utility statements pass through
        _ => Ok(RewriteResult::passthrough(&pq.original)),
    }
}

/// Builds a CTE per tracked table that merges overlay + source, filtering
/// tombstones, then substitutes the CTE name for the table reference.
///
/// For `SELECT * FROM users WHERE id = 1`:
///
/// ```sql
/// WITH "_rift_merged_users" AS (
///   SELECT * FROM "_rift_branch_dev"."users" WHERE NOT _rift_tombstone
///   UNION ALL
///   SELECT src.* FROM "public"."users" src
///   WHERE NOT EXISTS (
///     SELECT 1 FROM "_rift_branch_dev"."users" ovr WHERE ovr."id" = src."id"
///   )
/// )
/// SELECT * FROM _rift_merged_users WHERE id = 1
/// ```
fn rewrite_select(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    if pq.tables.is_empty() {
        return Ok(RewriteResult::passthrough(&pq.original));
    }

    let mut sql = pq.original.clone();
    let mut ctes = Vec::new();
    let mut has_overlay = false;

    for tbl in &pq.tables {
        let Some(cfg) = configs.get(&tbl.name) else {
            continue;
        };
        if cfg.pk_columns.is_empty() {
            return Err(RiftError::MissingPrimaryKey(tbl.name.clone()));
        }
        has_overlay = true;

        let merged_name = format!("_rift_merged_{}", tbl.name);
        let src_table = qualified_table(&cfg.source_schema, &tbl.name);
        let ovr_table = qualified_table(&cfg.branch_schema, &tbl.name);
        let pk_join = build_pk_join("ovr", "src", &cfg.pk_columns);

        let cte = format!(
            "{} AS (\n  SELECT * FROM {} WHERE NOT _rift_tombstone\n  UNION ALL\n  SELECT src.* FROM {} src\n  WHERE NOT EXISTS (\n    SELECT 1 FROM {} ovr WHERE {}\n  )\n)",
            quote_ident(&merged_name),
            ovr_table,
            src_table,
            ovr_table,
            pk_join,
        );
        ctes.push(cte);

        sql = replace_table_ref(&sql, tbl, &merged_name);
    }

    if !has_overlay {
        return Ok(RewriteResult::passthrough(&pq.original));
    }

    Ok(RewriteResult {
        sql: format!("WITH {}\n{}", ctes.join(", "), sql),
        is_passthrough: false,
        needs_overlay: true,
        table_name: pq.tables[0].name.clone(),
    })
}

/// Redirects the INSERT to the overlay table with an ON CONFLICT upsert so
/// re-inserting a previously tombstoned key resurrects the row.
fn rewrite_insert(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    let Some(tbl) = pq.tables.first() else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };
    let Some(cfg) = configs.get(&tbl.name) else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };

    let mut sql = replace_table_ref(
        &pq.original,
        tbl,
        &format!("{}.{}", cfg.branch_schema, tbl.name),
    );

    if !cfg.pk_columns.is_empty() {
        let pk_list = quote_idents(&cfg.pk_columns).join(", ");

        let mut set_clauses: Vec<String> = pq
            .target_columns
            .iter()
            .map(|col| format!("{} = EXCLUDED.{}", quote_ident(col), quote_ident(col)))
            .collect();
        set_clauses.push("_rift_tombstone = false".to_string());

        sql = sql.trim().trim_end_matches(';').to_string();
        sql.push_str(&format!(
            "\nON CONFLICT ({}) DO UPDATE SET {}",
            pk_list,
            set_clauses.join(", ")
        ));
    }

    Ok(RewriteResult {
        sql,
        is_passthrough: false,
        needs_overlay: true,
        table_name: tbl.name.clone(),
    })
}

/// Copies affected rows into the overlay, then applies the UPDATE there.
fn rewrite_update(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    let Some(tbl) = pq.tables.first() else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };
    let Some(cfg) = configs.get(&tbl.name) else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };
    if cfg.pk_columns.is_empty() {
        return Err(RiftError::MissingPrimaryKey(tbl.name.clone()));
    }

    let copy_sql = build_copy_in(tbl, cfg, &pq.original);

    // Apply the UPDATE on the overlay (no alias there, so strip qualifiers)
    let update_sql = replace_table_ref(
        &pq.original,
        tbl,
        &format!("{}.{}", cfg.branch_schema, tbl.name),
    );

    Ok(RewriteResult {
        sql: format!("{};\n{}", copy_sql, update_sql),
        is_passthrough: false,
        needs_overlay: true,
        table_name: tbl.name.clone(),
    })
}

/// Copies affected rows into the overlay, then marks them as tombstones.
fn rewrite_delete(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    let Some(tbl) = pq.tables.first() else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };
    let Some(cfg) = configs.get(&tbl.name) else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };
    if cfg.pk_columns.is_empty() {
        return Err(RiftError::MissingPrimaryKey(tbl.name.clone()));
    }

    let copy_sql = build_copy_in(tbl, cfg, &pq.original);

    let ovr_table = qualified_table(&cfg.branch_schema, &tbl.name);
    let where_clause = extract_where_clause(&pq.original);
    let qualifiers = table_qualifiers(tbl);

    let mut tombstone_sql = format!("UPDATE {} SET _rift_tombstone = true", ovr_table);
    if !where_clause.is_empty() {
        tombstone_sql.push_str(" WHERE ");
        tombstone_sql.push_str(&strip_table_qualifiers(&where_clause, &qualifiers));
    }

    Ok(RewriteResult {
        sql: format!("{};\n{}", copy_sql, tombstone_sql),
        is_passthrough: false,
        needs_overlay: true,
        table_name: tbl.name.clone(),
    })
}

/// Redirects DDL to the branch overlay schema. CREATE TABLE on a name with
/// no config yet borrows the branch schema from any available config.
fn rewrite_ddl(
    pq: &ParsedQuery,
    configs: &HashMap<String, RewriteConfig>,
) -> Result<RewriteResult> {
    let Some(tbl) = pq.tables.first() else {
        return Ok(RewriteResult::passthrough(&pq.original));
    };

    let branch_schema = match configs.get(&tbl.name) {
        Some(cfg) => cfg.branch_schema.clone(),
        None => match configs.values().next() {
            Some(cfg) => cfg.branch_schema.clone(),
            None => return Ok(RewriteResult::passthrough(&pq.original)),
        },
    };

    let sql = replace_table_ref(&pq.original, tbl, &format!("{}.{}", branch_schema, tbl.name));

    Ok(RewriteResult {
        sql,
        is_passthrough: false,
        needs_overlay: true,
        table_name: tbl.name.clone(),
    })
}

// --- Helpers ---

/// Copy-on-write step shared by UPDATE and DELETE: insert the matching
/// source rows into the overlay unless their PK is already there.
fn build_copy_in(tbl: &TableRef, cfg: &RewriteConfig, original: &str) -> String {
    let ovr_table = qualified_table(&cfg.branch_schema, &tbl.name);
    let src_table = qualified_table(&cfg.source_schema, &tbl.name);
    let pk_join = build_pk_join("ovr", "src", &cfg.pk_columns);

    let mut copy_sql = format!(
        "INSERT INTO {} SELECT src.*, false AS _rift_tombstone FROM {} src WHERE NOT EXISTS (SELECT 1 FROM {} ovr WHERE {})",
        ovr_table, src_table, ovr_table, pk_join
    );

    let where_clause = extract_where_clause(original);
    if !where_clause.is_empty() {
        let qualifiers = table_qualifiers(tbl);
        copy_sql.push_str(" AND (");
        copy_sql.push_str(&requalify_where_for_alias(&where_clause, "src", &qualifiers));
        copy_sql.push(')');
    }

    copy_sql
}

fn table_qualifiers(tbl: &TableRef) -> Vec<String> {
    let mut qualifiers = vec![tbl.name.clone(), tbl.qualified_name()];
    if let Some(alias) = &tbl.alias {
        qualifiers.push(alias.clone());
    }
    qualifiers
}

/// Quote a SQL identifier, doubling internal double-quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_idents(idents: &[String]) -> Vec<String> {
    idents.iter().map(|id| quote_ident(id)).collect()
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `left.k1 = right.k1 AND left.k2 = right.k2 ...` over the PK columns.
pub fn build_pk_join(left_alias: &str, right_alias: &str, pk_columns: &[String]) -> String {
    pk_columns
        .iter()
        .map(|col| {
            let qcol = quote_ident(col);
            format!("{}.{} = {}.{}", left_alias, qcol, right_alias, qcol)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Replace a table reference in SQL with a new name. Schema-qualified
/// references are matched as the full `schema.name` first.
fn replace_table_ref(sql: &str, tbl: &TableRef, new_ref: &str) -> String {
    if let Some(schema) = &tbl.schema {
        let old = format!("{}.{}", schema, tbl.name);
        return sql.replacen(&old, new_ref, 1);
    }
    replace_word(sql, &tbl.name, new_ref)
}

/// Replace whole-word occurrences of `old`, leaving matches embedded in
/// longer identifiers untouched.
fn replace_word(sql: &str, old: &str, new_word: &str) -> String {
    let mut result = sql.to_string();
    let mut idx = 0;
    while let Some(pos) = result[idx..].find(old) {
        let abs_pos = idx + pos;
        let end_pos = abs_pos + old.len();

        let before_ok = abs_pos == 0 || !is_ident_char(result.as_bytes()[abs_pos - 1]);
        let after_ok = end_pos >= result.len() || !is_ident_char(result.as_bytes()[end_pos]);

        if before_ok && after_ok {
            result.replace_range(abs_pos..end_pos, new_word);
            idx = abs_pos + new_word.len();
        } else {
            idx = end_pos;
        }
    }
    result
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Extract the WHERE clause body (without the keyword), trimming trailing
/// ORDER BY/LIMIT/OFFSET/GROUP BY/HAVING/RETURNING clauses.
pub fn extract_where_clause(sql: &str) -> String {
    let upper = sql.to_uppercase();
    let Some(idx) = upper.find(" WHERE ") else {
        return String::new();
    };
    let mut clause = &sql[idx + 7..];

    for kw in [
        " ORDER BY ",
        " LIMIT ",
        " OFFSET ",
        " GROUP BY ",
        " HAVING ",
        " RETURNING ",
    ] {
        if let Some(pos) = clause.to_uppercase().find(kw) {
            clause = &clause[..pos];
        }
    }

    clause.trim().trim_end_matches(';').trim_end().to_string()
}

/// Rewrite `qualifier.` prefixes in a WHERE clause to `alias.` so columns
/// resolve against the alias used by the copy-in subquery. Token-level and
/// case-tolerant, suitable for simple WHERE clauses.
pub fn requalify_where_for_alias(where_clause: &str, alias: &str, qualifiers: &[String]) -> String {
    let mut result = where_clause.to_string();
    for q in qualifiers {
        if q.is_empty() {
            continue;
        }
        for variant in [q.clone(), q.to_lowercase()] {
            result = result.replace(&format!("{}.", variant), &format!("{}.", alias));
        }
    }
    result
}

/// Remove `qualifier.` prefixes, leaving bare column names. Used for
/// clauses targeting the overlay table, which carries no alias.
pub fn strip_table_qualifiers(where_clause: &str, qualifiers: &[String]) -> String {
    let mut result = where_clause.to_string();
    for q in qualifiers {
        if q.is_empty() {
            continue;
        }
        for variant in [q.clone(), q.to_lowercase()] {
            result = result.replace(&format!("{}.", variant), "");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parse;

    fn dev_config(pk: &[&str]) -> RewriteConfig {
        RewriteConfig {
            branch_schema: "_rift_branch_dev".into(),
            source_schema: "public".into(),
            pk_columns: pk.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn users_configs(pk: &[&str]) -> HashMap<String, RewriteConfig> {
        let mut configs = HashMap::new();
        configs.insert("users".to_string(), dev_config(pk));
        configs
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("my\"weird\"name"), "\"my\"\"weird\"\"name\"");
    }

    #[test]
    fn test_build_pk_join_composite() {
        let pk = vec!["user_id".to_string(), "order_id".to_string()];
        assert_eq!(
            build_pk_join("ovr", "src", &pk),
            "ovr.\"user_id\" = src.\"user_id\" AND ovr.\"order_id\" = src.\"order_id\""
        );
    }

    #[test]
    fn test_rewrite_select() {
        let pq = parse("SELECT * FROM users WHERE id = 1").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();

        assert!(!result.is_passthrough);
        assert!(result.needs_overlay);
        assert_eq!(result.table_name, "users");
        assert!(result.sql.contains("\"_rift_merged_users\""));
        assert!(result.sql.contains("NOT _rift_tombstone"));
        assert!(result.sql.contains("NOT EXISTS"));
        assert!(result.sql.contains("ovr.\"id\" = src.\"id\""));
        assert!(result
            .sql
            .contains("SELECT * FROM _rift_merged_users WHERE id = 1"));
    }

    #[test]
    fn test_rewrite_select_no_overlay_verbatim() {
        let pq = parse("SELECT * FROM untouched WHERE id = 1").unwrap();
        let result = rewrite_for_branch(&pq, &HashMap::new()).unwrap();
        assert!(result.is_passthrough);
        assert_eq!(result.sql, "SELECT * FROM untouched WHERE id = 1");
    }

    #[test]
    fn test_rewrite_select_missing_pk() {
        let pq = parse("SELECT * FROM users").unwrap();
        let err = rewrite_for_branch(&pq, &users_configs(&[])).unwrap_err();
        assert!(matches!(err, RiftError::MissingPrimaryKey(_)));
    }

    #[test]
    fn test_rewrite_insert() {
        let pq = parse("INSERT INTO users (name) VALUES ('Charlie')").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();

        assert!(result.sql.contains("_rift_branch_dev.users"));
        assert!(result
            .sql
            .contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", _rift_tombstone = false"));
    }

    #[test]
    fn test_rewrite_insert_untracked_passthrough() {
        let pq = parse("INSERT INTO other (name) VALUES ('x')").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();
        assert!(result.is_passthrough);
    }

    #[test]
    fn test_rewrite_update_two_statements() {
        let pq = parse("UPDATE users SET name = 'Robert' WHERE id = 2").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();

        let parts: Vec<&str> = result.sql.splitn(2, ";\n").collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("INSERT INTO \"_rift_branch_dev\".\"users\""));
        assert!(parts[0].contains("SELECT src.*, false AS _rift_tombstone"));
        assert!(parts[0].contains("NOT EXISTS"));
        assert!(parts[0].contains("AND (id = 2)"));
        assert!(parts[1].contains("UPDATE _rift_branch_dev.users SET name = 'Robert'"));
    }

    #[test]
    fn test_rewrite_delete_two_statements() {
        let pq = parse("DELETE FROM users WHERE id = 1").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();

        let parts: Vec<&str> = result.sql.splitn(2, ";\n").collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("INSERT INTO \"_rift_branch_dev\".\"users\""));
        assert!(parts[0].contains("NOT EXISTS"));
        assert_eq!(
            parts[1],
            "UPDATE \"_rift_branch_dev\".\"users\" SET _rift_tombstone = true WHERE id = 1"
        );
    }

    #[test]
    fn test_rewrite_delete_qualified_where() {
        let pq = parse("DELETE FROM users WHERE users.id = 1").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();
        let parts: Vec<&str> = result.sql.splitn(2, ";\n").collect();
        assert!(parts[0].contains("AND (src.id = 1)"));
        assert!(parts[1].ends_with("WHERE id = 1"));
    }

    #[test]
    fn test_rewrite_ddl_create_table() {
        let pq = parse("CREATE TABLE widgets (id INT PRIMARY KEY)").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();
        assert!(result.sql.contains("_rift_branch_dev.widgets"));
        assert!(result.needs_overlay);
    }

    #[test]
    fn test_rewrite_ddl_no_configs_passthrough() {
        let pq = parse("CREATE TABLE widgets (id INT PRIMARY KEY)").unwrap();
        let result = rewrite_for_branch(&pq, &HashMap::new()).unwrap();
        assert!(result.is_passthrough);
    }

    #[test]
    fn test_rewrite_passthrough_utility() {
        let pq = parse("SET search_path TO public").unwrap();
        let result = rewrite_for_branch(&pq, &users_configs(&["id"])).unwrap();
        assert!(result.is_passthrough);
        assert_eq!(result.sql, "SET search_path TO public");
    }

    #[test]
    fn test_extract_where_clause() {
        assert_eq!(
            extract_where_clause("SELECT * FROM t WHERE a = 1 ORDER BY b LIMIT 5"),
            "a = 1"
        );
        assert_eq!(
            extract_where_clause("DELETE FROM t WHERE x > 2;"),
            "x > 2"
        );
        assert_eq!(extract_where_clause("SELECT * FROM t"), "");
    }

    #[test]
    fn test_replace_word_boundaries() {
        // "users" embedded in "users_archive" must not be replaced
        let sql = "SELECT * FROM users_archive, users";
        let out = replace_word(sql, "users", "merged");
        assert_eq!(out, "SELECT * FROM users_archive, merged");
    }
}
