//! SQL statement analysis
//!
//! Classifies a statement into a tagged kind and extracts the tables it
//! references, which is everything the rewriter needs. Subqueries and CTEs
//! are deliberately not descended into: only outer-level table references
//! participate in overlay rewriting.

use rift_common::{Result, RiftError};
use sqlparser::ast::{
    Join, ObjectName, ObjectType, Query, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::fmt;

/// Kind of SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    #[default]
    Unknown,
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    /// SET, SHOW, transaction control, COPY, EXPLAIN, VACUUM, etc.
    Utility,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryKind::Select => "SELECT",
            QueryKind::Insert => "INSERT",
            QueryKind::Update => "UPDATE",
            QueryKind::Delete => "DELETE",
            QueryKind::Ddl => "DDL",
            QueryKind::Utility => "UTILITY",
            QueryKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Sub-kind for DDL statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdlKind {
    #[default]
    None,
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
    DropIndex,
    Other,
}

/// A table referenced in a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// schema.table, or just table when unqualified
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

/// Analysis result for a single SQL statement
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub original: String,
    pub kind: QueryKind,
    pub ddl_kind: DdlKind,
    pub tables: Vec<TableRef>,
    /// For INSERT: explicit target columns in source order
    pub target_columns: Vec<String>,
}

impl ParsedQuery {
    pub fn is_read_only(&self) -> bool {
        self.kind == QueryKind::Select
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            QueryKind::Insert | QueryKind::Update | QueryKind::Delete
        )
    }

    pub fn is_ddl(&self) -> bool {
        self.kind == QueryKind::Ddl
    }

    pub fn is_utility(&self) -> bool {
        self.kind == QueryKind::Utility
    }
}

/// DDL metadata for branch tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlInfo {
    pub kind: DdlKind,
    pub table_name: String,
    pub schema: String,
}

/// Parse a SQL string and classify its first statement.
pub fn parse(sql: &str) -> Result<ParsedQuery> {
    let dialect = PostgreSqlDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| RiftError::Parse(e.to_string()))?;

    let mut pq = ParsedQuery {
        original: sql.to_string(),
        ..Default::default()
    };

    let Some(stmt) = statements.first() else {
        return Ok(pq);
    };

    classify_statement(&mut pq, stmt);
    Ok(pq)
}

fn classify_statement(pq: &mut ParsedQuery, stmt: &Statement) {
    match stmt {
        Statement::Query(query) => {
            pq.kind = QueryKind::Select;
            extract_select_tables(pq, query);
        }
        Statement::Insert {
            table_name,
            columns,
            ..
        } => {
            pq.kind = QueryKind::Insert;
            push_object_name(pq, table_name, None);
            pq.target_columns = columns.iter().map(|c| c.value.clone()).collect();
        }
        Statement::Update { table, from, .. } => {
            pq.kind = QueryKind::Update;
            extract_table_with_joins(pq, table);
            if let Some(from) = from {
                extract_table_with_joins(pq, from);
            }
        }
        Statement::Delete { from, .. } => {
            pq.kind = QueryKind::Delete;
            for twj in from {
                extract_table_with_joins(pq, twj);
            }
        }
        Statement::CreateTable { name, .. } => {
            pq.kind = QueryKind::Ddl;
            pq.ddl_kind = DdlKind::CreateTable;
            push_object_name(pq, name, None);
        }
        Statement::AlterTable { name, .. } => {
            pq.kind = QueryKind::Ddl;
            pq.ddl_kind = DdlKind::AlterTable;
            push_object_name(pq, name, None);
        }
        Statement::Drop {
            object_type, names, ..
        } => {
            pq.kind = QueryKind::Ddl;
            pq.ddl_kind = match object_type {
                ObjectType::Table => DdlKind::DropTable,
                ObjectType::Index => DdlKind::DropIndex,
                _ => DdlKind::Other,
            };
            for name in names {
                push_object_name(pq, name, None);
            }
        }
        Statement::CreateIndex { table_name, .. } => {
            pq.kind = QueryKind::Ddl;
            pq.ddl_kind = DdlKind::CreateIndex;
            push_object_name(pq, table_name, None);
        }
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::SetVariable { .. }
        | Statement::ShowVariable { .. } => {
            pq.kind = QueryKind::Utility;
        }
        // COPY, EXPLAIN, VACUUM, and everything else
        _ => {
            pq.kind = QueryKind::Utility;
        }
    }
}

fn extract_select_tables(pq: &mut ParsedQuery, query: &Query) {
    if let SetExpr::Select(select) = query.body.as_ref() {
        for twj in &select.from {
            extract_table_with_joins(pq, twj);
        }
    }
}

fn extract_table_with_joins(pq: &mut ParsedQuery, twj: &TableWithJoins) {
    extract_table_factor(pq, &twj.relation);
    for join in &twj.joins {
        extract_join(pq, join);
    }
}

fn extract_join(pq: &mut ParsedQuery, join: &Join) {
    extract_table_factor(pq, &join.relation);
}

fn extract_table_factor(pq: &mut ParsedQuery, factor: &TableFactor) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            push_object_name(pq, name, alias.as_ref().map(|a| a.name.value.clone()));
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            extract_table_with_joins(pq, table_with_joins);
        }
        // Subqueries don't add to the table list
        _ => {}
    }
}

fn push_object_name(pq: &mut ParsedQuery, name: &ObjectName, alias: Option<String>) {
    let parts: Vec<String> = name.0.iter().map(|id| id.value.clone()).collect();
    if parts.is_empty() {
        return;
    }
    let table = parts[parts.len() - 1].clone();
    let schema = if parts.len() >= 2 {
        Some(parts[parts.len() - 2].clone())
    } else {
        None
    };
    pq.tables.push(TableRef {
        schema,
        name: table,
        alias,
    });
}

/// Fast prefix test for transaction control, used before full parsing.
pub fn is_transaction_control(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    upper.starts_with("BEGIN")
        || upper.starts_with("COMMIT")
        || upper.starts_with("ROLLBACK")
        || upper.starts_with("SAVEPOINT")
        || upper.starts_with("RELEASE SAVEPOINT")
        || upper.starts_with("START TRANSACTION")
        || upper.starts_with("END")
}

/// DDL metadata from a parsed query, or None for non-DDL statements.
pub fn extract_ddl_info(pq: &ParsedQuery) -> Option<DdlInfo> {
    if pq.kind != QueryKind::Ddl {
        return None;
    }

    let mut info = DdlInfo {
        kind: pq.ddl_kind,
        table_name: String::new(),
        schema: "public".into(),
    };

    if let Some(tbl) = pq.tables.first() {
        info.table_name = tbl.name.clone();
        if let Some(schema) = &tbl.schema {
            info.schema = schema.clone();
        }
    }

    Some(info)
}

/// True if the DDL affects a table (CREATE/ALTER/DROP TABLE).
pub fn is_table_ddl(pq: &ParsedQuery) -> bool {
    pq.kind == QueryKind::Ddl
        && matches!(
            pq.ddl_kind,
            DdlKind::CreateTable | DdlKind::AlterTable | DdlKind::DropTable
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select() {
        let pq = parse("SELECT * FROM users WHERE id = 1").unwrap();
        assert_eq!(pq.kind, QueryKind::Select);
        assert!(pq.is_read_only());
        assert_eq!(pq.tables.len(), 1);
        assert_eq!(pq.tables[0].name, "users");
        assert!(pq.tables[0].schema.is_none());
    }

    #[test]
    fn test_parse_select_join() {
        let pq = parse(
            "SELECT u.name, o.total FROM users u JOIN orders o ON o.user_id = u.id",
        )
        .unwrap();
        assert_eq!(pq.kind, QueryKind::Select);
        assert_eq!(pq.tables.len(), 2);
        assert_eq!(pq.tables[0].name, "users");
        assert_eq!(pq.tables[0].alias.as_deref(), Some("u"));
        assert_eq!(pq.tables[1].name, "orders");
        assert_eq!(pq.tables[1].alias.as_deref(), Some("o"));
    }

    #[test]
    fn test_parse_select_subquery_ignored() {
        let pq = parse("SELECT * FROM (SELECT id FROM users) sub").unwrap();
        assert_eq!(pq.kind, QueryKind::Select);
        assert!(pq.tables.is_empty());
    }

    #[test]
    fn test_parse_insert() {
        let pq = parse("INSERT INTO users (name, email) VALUES ('a', 'b')").unwrap();
        assert_eq!(pq.kind, QueryKind::Insert);
        assert!(pq.is_write());
        assert_eq!(pq.tables[0].name, "users");
        assert_eq!(pq.target_columns, vec!["name", "email"]);
    }

    #[test]
    fn test_parse_update() {
        let pq = parse("UPDATE users SET name = 'x' WHERE id = 1").unwrap();
        assert_eq!(pq.kind, QueryKind::Update);
        assert_eq!(pq.tables[0].name, "users");
    }

    #[test]
    fn test_parse_delete() {
        let pq = parse("DELETE FROM users WHERE id = 1").unwrap();
        assert_eq!(pq.kind, QueryKind::Delete);
        assert_eq!(pq.tables[0].name, "users");
    }

    #[test]
    fn test_parse_ddl_create_table() {
        let pq = parse("CREATE TABLE widgets (id INT PRIMARY KEY, name TEXT)").unwrap();
        assert_eq!(pq.kind, QueryKind::Ddl);
        assert_eq!(pq.ddl_kind, DdlKind::CreateTable);
        assert_eq!(pq.tables[0].name, "widgets");
        assert!(is_table_ddl(&pq));
    }

    #[test]
    fn test_parse_ddl_alter_table() {
        let pq = parse("ALTER TABLE users ADD COLUMN age INT").unwrap();
        assert_eq!(pq.ddl_kind, DdlKind::AlterTable);
        assert_eq!(pq.tables[0].name, "users");
    }

    #[test]
    fn test_parse_ddl_drop_table() {
        let pq = parse("DROP TABLE users").unwrap();
        assert_eq!(pq.ddl_kind, DdlKind::DropTable);
        assert_eq!(pq.tables[0].name, "users");
    }

    #[test]
    fn test_parse_ddl_drop_index() {
        let pq = parse("DROP INDEX idx_users_name").unwrap();
        assert_eq!(pq.kind, QueryKind::Ddl);
        assert_eq!(pq.ddl_kind, DdlKind::DropIndex);
    }

    #[test]
    fn test_parse_utility_statements() {
        for sql in ["SET search_path TO public", "SHOW server_version", "BEGIN"] {
            let pq = parse(sql).unwrap();
            assert!(pq.is_utility(), "{} should be utility", sql);
        }
    }

    #[test]
    fn test_parse_schema_qualified() {
        let pq = parse("SELECT * FROM analytics.events").unwrap();
        assert_eq!(pq.tables[0].schema.as_deref(), Some("analytics"));
        assert_eq!(pq.tables[0].name, "events");
        assert_eq!(pq.tables[0].qualified_name(), "analytics.events");
    }

    #[test]
    fn test_parse_error() {
        let err = parse("SELEC * FRM users").unwrap_err();
        assert!(matches!(err, RiftError::Parse(_)));
    }

    #[test]
    fn test_is_transaction_control() {
        for sql in [
            "BEGIN",
            "begin;",
            "COMMIT",
            "rollback",
            "SAVEPOINT sp1",
            "RELEASE SAVEPOINT sp1",
            "START TRANSACTION",
            "END",
        ] {
            assert!(is_transaction_control(sql), "{}", sql);
        }
        assert!(!is_transaction_control("SELECT 1"));
        assert!(!is_transaction_control("INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_extract_ddl_info() {
        let pq = parse("CREATE TABLE reports.daily (id INT PRIMARY KEY)").unwrap();
        let info = extract_ddl_info(&pq).unwrap();
        assert_eq!(info.kind, DdlKind::CreateTable);
        assert_eq!(info.table_name, "daily");
        assert_eq!(info.schema, "reports");

        let select = parse("SELECT 1").unwrap();
        assert!(extract_ddl_info(&select).is_none());
    }

    #[test]
    fn test_query_kind_display() {
        assert_eq!(QueryKind::Select.to_string(), "SELECT");
        assert_eq!(QueryKind::Utility.to_string(), "UTILITY");
    }
}
