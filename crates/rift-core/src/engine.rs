//! Copy-on-write query engine
//!
//! Composes the analyzer, rewriter, overlay manager, and metadata store:
//! one call takes a branch name and a SQL text and returns either a
//! passthrough or the rewritten CoW statements for that branch.

use crate::analyzer::{self, ParsedQuery, QueryKind};
use crate::branch::BranchManager;
use crate::diff::{diff_table, BranchDiff};
use crate::merge::{generate_merge_sql, MergeSql};
use crate::overlay;
use crate::rewriter::{rewrite_for_branch, RewriteConfig};
use crate::store::{branch_schema_name, Branch, MetaStore, PrimaryKeyColumn, TrackedTable};
use rift_common::{Result, RiftError};
use std::collections::HashMap;
use tracing::debug;

/// Result of processing a SQL query through the engine.
#[derive(Debug, Clone, Default)]
pub struct ProcessedQuery {
    pub original_sql: String,
    pub rewritten_sql: String,
    pub kind: QueryKind,
    pub needs_overlay: bool,
    pub is_passthrough: bool,
    pub table_name: String,
}

impl ProcessedQuery {
    fn passthrough(sql: &str, kind: QueryKind) -> Self {
        Self {
            original_sql: sql.to_string(),
            rewritten_sql: sql.to_string(),
            kind,
            is_passthrough: true,
            ..Default::default()
        }
    }
}

/// The copy-on-write engine.
pub struct Engine {
    store: MetaStore,
}

impl Engine {
    pub fn new(store: MetaStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn manager(&self) -> BranchManager<'_> {
        BranchManager::new(&self.store)
    }

    /// Parse and rewrite a SQL query for the given branch. Queries on the
    /// main branch pass through unmodified.
    pub async fn process_query(&self, branch_name: &str, sql: &str) -> Result<ProcessedQuery> {
        if branch_name == "main" {
            return Ok(ProcessedQuery::passthrough(sql, QueryKind::Unknown));
        }

        if analyzer::is_transaction_control(sql) {
            return Ok(ProcessedQuery::passthrough(sql, QueryKind::Utility));
        }

        let pq = analyzer::parse(sql)?;

        if pq.is_utility() {
            return Ok(ProcessedQuery::passthrough(sql, pq.kind));
        }

        let mut configs = self.build_rewrite_configs(branch_name, &pq).await?;

        if pq.is_write() || pq.is_ddl() {
            self.ensure_overlays(branch_name, &pq).await?;
            // PKs may have been cached during overlay creation
            configs = self.build_rewrite_configs(branch_name, &pq).await?;
        }

        let result = rewrite_for_branch(&pq, &configs)?;
        debug!(
            branch = branch_name,
            kind = %pq.kind,
            passthrough = result.is_passthrough,
            "processed query"
        );

        Ok(ProcessedQuery {
            original_sql: sql.to_string(),
            rewritten_sql: result.sql,
            kind: pq.kind,
            needs_overlay: result.needs_overlay,
            is_passthrough: result.is_passthrough,
            table_name: result.table_name,
        })
    }

    /// Create a new branch and its overlay schema.
    pub async fn create_branch(
        &self,
        name: &str,
        parent: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Branch> {
        self.manager().create(name, parent, ttl_seconds).await
    }

    /// Delete a branch and its overlay schema.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.manager().delete(name).await
    }

    /// Compute changes between a branch and its parent.
    pub async fn diff(&self, branch_name: &str) -> Result<BranchDiff> {
        let branch = self.store.get_branch(branch_name).await?;
        let tables = self.store.list_tracked_tables(branch_name).await?;
        let branch_schema = branch_schema_name(branch_name);

        let mut diff = BranchDiff {
            branch_name: branch_name.to_string(),
            parent: branch.parent,
            tables: Vec::new(),
        };

        for t in tables {
            let pk_cols = self.pk_columns(&t.source_schema, &t.table_name).await?;
            let td = diff_table(
                self.store.pool(),
                &branch_schema,
                &t.source_schema,
                &t.table_name,
                &pk_cols,
            )
            .await?;
            diff.tables.push(td);
        }

        Ok(diff)
    }

    /// Generate merge SQL applying branch changes to the parent. The SQL is
    /// returned for review, never executed here.
    pub async fn generate_merge(&self, branch_name: &str) -> Result<Vec<MergeSql>> {
        let tables = self.store.list_tracked_tables(branch_name).await?;
        let branch_schema = branch_schema_name(branch_name);

        let mut merges = Vec::new();
        for t in tables {
            let pk_cols = self.pk_columns(&t.source_schema, &t.table_name).await?;
            let m = generate_merge_sql(
                self.store.pool(),
                &branch_schema,
                &t.source_schema,
                &t.table_name,
                &pk_cols,
            )
            .await?;
            merges.push(m);
        }

        Ok(merges)
    }

    /// Build rewrite configs for each table the query references. Reads only
    /// get a config for already-tracked tables, so a SELECT on an untouched
    /// table falls through to the source unchanged.
    async fn build_rewrite_configs(
        &self,
        branch_name: &str,
        pq: &ParsedQuery,
    ) -> Result<HashMap<String, RewriteConfig>> {
        let mut configs = HashMap::new();
        let branch_schema = branch_schema_name(branch_name);
        let pool = self.store.pool();

        for tbl in &pq.tables {
            let schema = tbl.schema.clone().unwrap_or_else(|| "public".to_string());

            let overlay_exists = overlay::table_exists(pool, &branch_schema, &tbl.name).await?;

            if !overlay_exists && pq.is_read_only() {
                let tracked = self
                    .store
                    .list_tracked_tables(branch_name)
                    .await?
                    .iter()
                    .any(|tt| tt.table_name == tbl.name && tt.source_schema == schema);
                if !tracked {
                    continue;
                }
            }

            let pk_cols = self.pk_columns(&schema, &tbl.name).await?;

            configs.insert(
                tbl.name.clone(),
                RewriteConfig {
                    branch_schema: branch_schema.clone(),
                    source_schema: schema,
                    pk_columns: pk_cols,
                },
            );
        }

        Ok(configs)
    }

    /// Create overlay tables, cache PKs, and record tracked-table entries
    /// for every table a write or DDL statement touches.
    async fn ensure_overlays(&self, branch_name: &str, pq: &ParsedQuery) -> Result<()> {
        let pool = self.store.pool();
        let branch_schema = branch_schema_name(branch_name);

        for tbl in &pq.tables {
            let schema = tbl.schema.clone().unwrap_or_else(|| "public".to_string());

            // Rift's own metadata is never branched
            if schema == "_rift" {
                continue;
            }

            let src_exists = overlay::table_exists(pool, &schema, &tbl.name).await?;
            if !src_exists {
                // CREATE TABLE targets a table that doesn't exist yet
                if pq.is_ddl() {
                    continue;
                }
                return Err(RiftError::UnknownTable(format!("{}.{}", schema, tbl.name)));
            }

            overlay::ensure_overlay_table(pool, &branch_schema, &schema, &tbl.name).await?;

            let pk_cols = overlay::get_table_primary_keys(pool, &schema, &tbl.name).await?;
            let pk_entries: Vec<PrimaryKeyColumn> = pk_cols
                .iter()
                .enumerate()
                .map(|(i, col)| PrimaryKeyColumn {
                    source_schema: schema.clone(),
                    table_name: tbl.name.clone(),
                    column_name: col.clone(),
                    ordinal: i as i32 + 1,
                })
                .collect();
            self.store.cache_primary_keys(&pk_entries).await?;

            self.store
                .track_table(&TrackedTable {
                    branch_name: branch_name.to_string(),
                    source_schema: schema,
                    table_name: tbl.name.clone(),
                    overlay_table: tbl.name.clone(),
                    has_tombstones: false,
                    row_count: 0,
                })
                .await?;
        }

        Ok(())
    }

    /// PK column names for a table, preferring the metadata cache.
    async fn pk_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let cached = self.store.get_primary_keys(schema, table).await?;
        if !cached.is_empty() {
            return Ok(cached.into_iter().map(|pk| pk.column_name).collect());
        }
        overlay::get_table_primary_keys(self.store.pool(), schema, table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_query_passthrough() {
        let pq = ProcessedQuery::passthrough("SELECT 1", QueryKind::Select);
        assert!(pq.is_passthrough);
        assert_eq!(pq.original_sql, pq.rewritten_sql);
        assert!(!pq.needs_overlay);
        assert!(pq.table_name.is_empty());
    }
}
