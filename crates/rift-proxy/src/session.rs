//! Branch session
//!
//! Handles a client connection for a non-main branch. Queries are rewritten
//! by the CoW engine and executed against the shared upstream pool; results
//! are streamed back in text format. The session holds at most one upstream
//! transaction; extended-protocol errors are deferred until Sync.

use crate::pg_wire::codec::MessageBuf;
use crate::pg_wire::connection::ClientConn;
use crate::pg_wire::constants::{
    MSG_BIND, MSG_BIND_COMPLETE, MSG_CLOSE, MSG_CLOSE_COMPLETE, MSG_DATA_ROW, MSG_DESCRIBE,
    MSG_EMPTY_QUERY_RESPONSE, MSG_EXECUTE, MSG_FLUSH, MSG_NO_DATA, MSG_PARAMETER_DESCRIPTION,
    MSG_PARSE, MSG_PARSE_COMPLETE, MSG_QUERY, MSG_ROW_DESCRIPTION, MSG_SYNC, MSG_TERMINATE,
    TX_STATUS_FAILED, TX_STATUS_IDLE, TX_STATUS_IN_TX,
};
use crate::pg_wire::messages::{self, FieldDescription};
use crate::pg_wire::types::{pg_type_len, pg_type_oid};
use futures_util::TryStreamExt;
use rift_common::{Result, RiftError};
use rift_core::analyzer::QueryKind;
use rift_core::{Engine, ProcessedQuery};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// A parsed statement waiting for binding.
#[derive(Debug, Clone)]
struct PreparedStmt {
    sql: String,
    processed: ProcessedQuery,
}

/// A bound statement ready for execution.
#[derive(Debug, Clone)]
struct Portal {
    sql: String,
    processed: ProcessedQuery,
    params: Vec<Option<String>>,
}

/// Per-connection session state for a non-main branch.
pub struct Session<S> {
    conn: ClientConn<S>,
    pool: PgPool,
    engine: Arc<Engine>,
    branch: String,

    tx: Option<Transaction<'static, Postgres>>,
    tx_status: u8,

    stmts: HashMap<String, PreparedStmt>,
    portals: HashMap<String, Portal>,
    /// Deferred error for the extended-query cycle, emitted at Sync
    ext_err: Option<RiftError>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: ClientConn<S>, pool: PgPool, engine: Arc<Engine>, branch: String) -> Self {
        Self {
            conn,
            pool,
            engine,
            branch,
            tx: None,
            tx_status: TX_STATUS_IDLE,
            stmts: HashMap::new(),
            portals: HashMap::new(),
            ext_err: None,
        }
    }

    /// Process messages until the client terminates or disconnects.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let (msg_type, payload) = match self.conn.read_message().await {
                Ok(msg) => msg,
                Err(_) => {
                    debug!(branch = %self.branch, "client disconnected");
                    break;
                }
            };

            match msg_type {
                MSG_TERMINATE => break,
                MSG_QUERY => self.handle_simple_query(&payload).await?,
                MSG_PARSE => self.handle_parse(&payload).await?,
                MSG_BIND => self.handle_bind(&payload).await?,
                MSG_DESCRIBE => self.handle_describe(&payload).await?,
                MSG_EXECUTE => self.handle_execute(&payload).await?,
                MSG_CLOSE => self.handle_close(&payload).await?,
                MSG_SYNC => self.handle_sync().await?,
                MSG_FLUSH => {
                    // Writes are not buffered beyond the OS
                    self.conn.flush().await?;
                }
                other => {
                    debug!("unknown message type 0x{:02x}", other);
                    self.conn.send_ready_for_query(self.tx_status).await?;
                }
            }
        }

        // Abandon any in-flight transaction
        if let Some(tx) = self.tx.take() {
            let _ = tx.rollback().await;
        }
        Ok(())
    }

    // ===== Simple query protocol =====

    async fn handle_simple_query(&mut self, payload: &[u8]) -> Result<()> {
        let sql = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .trim()
            .to_string();

        if sql.is_empty() {
            self.conn
                .write_message(MSG_EMPTY_QUERY_RESPONSE, &[])
                .await?;
            return self.conn.send_ready_for_query(self.tx_status).await;
        }

        debug!(branch = %self.branch, %sql, "query");

        if is_begin(&sql) {
            self.handle_begin().await?;
            return self.conn.send_ready_for_query(self.tx_status).await;
        }
        if is_commit(&sql) {
            self.handle_commit().await?;
            return self.conn.send_ready_for_query(self.tx_status).await;
        }
        if is_rollback(&sql) {
            self.handle_rollback().await?;
            return self.conn.send_ready_for_query(self.tx_status).await;
        }

        let processed = match self.engine.process_query(&self.branch, &sql).await {
            Ok(p) => p,
            Err(e) => return self.send_query_error(e).await,
        };

        if let Err(e) = self.execute_processed(&processed, &[]).await {
            return self.send_query_error(e).await;
        }

        self.conn.send_ready_for_query(self.tx_status).await
    }

    /// Run a processed query's statements and send results to the client.
    /// Multi-statement rewrites (copy-on-write UPDATE/DELETE) are split on
    /// top-level semicolons; only the final fragment produces client output.
    async fn execute_processed(
        &mut self,
        processed: &ProcessedQuery,
        params: &[Option<String>],
    ) -> Result<()> {
        let statements = split_statements(&processed.rewritten_sql);
        let last = statements.len().saturating_sub(1);

        for (i, stmt) in statements.iter().enumerate() {
            let is_last = i == last;
            // Parameters apply only to the first fragment
            let frag_params = if i == 0 { params } else { &[] };

            if processed.kind == QueryKind::Select && is_last {
                self.stream_select(stmt, frag_params).await?;
            } else {
                let rows = self.run_exec(stmt, frag_params).await?;
                if is_last {
                    let tag = command_tag(stmt, rows);
                    self.conn.send_command_complete(&tag).await?;
                }
            }
        }

        self.conn.flush().await
    }

    /// Execute a statement that returns rows, streaming them back as
    /// RowDescription + DataRow* + CommandComplete.
    async fn stream_select(&mut self, sql: &str, params: &[Option<String>]) -> Result<()> {
        let mut query = sqlx::query(sql);
        for p in params {
            query = query.bind(p.clone());
        }

        let conn = &mut self.conn;
        let mut sent_description = false;
        let mut row_count: u64 = 0;

        let stream_result: std::result::Result<(), sqlx::Error> = match self.tx.as_mut() {
            Some(tx) => {
                let mut rows = query.fetch(&mut **tx);
                loop {
                    match rows.try_next().await {
                        Ok(Some(row)) => {
                            if !sent_description {
                                conn.write_message(MSG_ROW_DESCRIPTION, &describe_row(&row))
                                    .await?;
                                sent_description = true;
                            }
                            conn.write_message(MSG_DATA_ROW, &messages::data_row(&encode_row(&row)))
                                .await?;
                            row_count += 1;
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
            None => {
                let mut rows = query.fetch(&self.pool);
                loop {
                    match rows.try_next().await {
                        Ok(Some(row)) => {
                            if !sent_description {
                                conn.write_message(MSG_ROW_DESCRIPTION, &describe_row(&row))
                                    .await?;
                                sent_description = true;
                            }
                            conn.write_message(MSG_DATA_ROW, &messages::data_row(&encode_row(&row)))
                                .await?;
                            row_count += 1;
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = stream_result {
            self.mark_failed();
            return Err(executor_error(e));
        }

        if !sent_description {
            // Column metadata is only available once a row arrives
            conn.write_message(MSG_ROW_DESCRIPTION, &messages::row_description(&[]))
                .await?;
        }
        conn.send_command_complete(&format!("SELECT {}", row_count))
            .await
    }

    /// Execute a statement without result rows, returning rows affected.
    async fn run_exec(&mut self, sql: &str, params: &[Option<String>]) -> Result<u64> {
        let mut query = sqlx::query(sql);
        for p in params {
            query = query.bind(p.clone());
        }

        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        };

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => {
                self.mark_failed();
                Err(executor_error(e))
            }
        }
    }

    // ===== Transaction control =====

    async fn handle_begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            // Nested BEGIN is a no-op, like the upstream's warning behavior
            self.conn
                .send_notice("there is already a transaction in progress")
                .await?;
            return self.conn.send_command_complete("BEGIN").await;
        }

        let tx = self
            .pool
            .begin()
            .await
            .map_err(executor_error)?;
        self.tx = Some(tx);
        self.tx_status = TX_STATUS_IN_TX;
        self.conn.send_command_complete("BEGIN").await
    }

    async fn handle_commit(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return self.conn.send_command_complete("COMMIT").await;
        };

        let result = tx.commit().await;
        self.tx_status = TX_STATUS_IDLE;
        match result {
            Ok(()) => self.conn.send_command_complete("COMMIT").await,
            Err(e) => Err(executor_error(e)),
        }
    }

    async fn handle_rollback(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return self.conn.send_command_complete("ROLLBACK").await;
        };

        let result = tx.rollback().await;
        self.tx_status = TX_STATUS_IDLE;
        match result {
            Ok(()) => self.conn.send_command_complete("ROLLBACK").await,
            Err(e) => Err(executor_error(e)),
        }
    }

    fn mark_failed(&mut self) {
        if self.tx_status == TX_STATUS_IN_TX {
            self.tx_status = TX_STATUS_FAILED;
        }
    }

    /// Report a recoverable query error and return to the ready state.
    async fn send_query_error(&mut self, err: RiftError) -> Result<()> {
        self.mark_failed();
        warn!(branch = %self.branch, "query error: {}", err);
        self.conn
            .send_error("ERROR", err.sqlstate(), &err.to_string())
            .await?;
        self.conn.send_ready_for_query(self.tx_status).await
    }

    // ===== Extended query protocol =====

    async fn handle_parse(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = MessageBuf::from_bytes(payload);
        let name = buf.get_cstr()?;
        let sql = buf.get_cstr()?.trim().to_string();
        // Parameter type OIDs are skipped; the upstream infers types

        let processed = if sql.is_empty() {
            ProcessedQuery {
                is_passthrough: true,
                ..Default::default()
            }
        } else if is_begin(&sql)
            || is_commit(&sql)
            || is_rollback(&sql)
            || rift_core::analyzer::is_transaction_control(&sql)
        {
            ProcessedQuery {
                original_sql: sql.clone(),
                rewritten_sql: sql.clone(),
                kind: QueryKind::Utility,
                is_passthrough: true,
                ..Default::default()
            }
        } else {
            match self.engine.process_query(&self.branch, &sql).await {
                Ok(p) => p,
                Err(e) => {
                    // Surfaced at the next Sync
                    self.ext_err = Some(e);
                    return Ok(());
                }
            }
        };

        self.stmts.insert(name, PreparedStmt { sql, processed });
        self.conn.write_message(MSG_PARSE_COMPLETE, &[]).await?;
        self.conn.flush().await
    }

    async fn handle_bind(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = MessageBuf::from_bytes(payload);
        let portal_name = buf.get_cstr()?;
        let stmt_name = buf.get_cstr()?;

        let Some(stmt) = self.stmts.get(&stmt_name) else {
            self.ext_err = Some(RiftError::Protocol(format!(
                "prepared statement {:?} does not exist",
                stmt_name
            )));
            return Ok(());
        };
        let stmt = stmt.clone();

        // Parameter format codes are skipped; parameters arrive as text
        let num_formats = buf.get_i16()?;
        for _ in 0..num_formats {
            let _ = buf.get_i16()?;
        }

        let num_params = buf.get_i16()?;
        let mut params = Vec::with_capacity(num_params.max(0) as usize);
        for _ in 0..num_params {
            let len = buf.get_i32()?;
            if len == -1 {
                params.push(None);
            } else {
                let raw = buf.get_bytes(len as usize)?;
                params.push(Some(String::from_utf8_lossy(&raw).into_owned()));
            }
        }
        // Result format codes are skipped; results are always text

        self.portals.insert(
            portal_name,
            Portal {
                sql: stmt.sql,
                processed: stmt.processed,
                params,
            },
        );

        self.conn.write_message(MSG_BIND_COMPLETE, &[]).await?;
        self.conn.flush().await
    }

    async fn handle_describe(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 2 {
            self.ext_err = Some(RiftError::Protocol("invalid describe message".into()));
            return Ok(());
        }

        let describe_type = payload[0];
        let mut buf = MessageBuf::from_bytes(&payload[1..]);
        let name = buf.get_cstr().unwrap_or_default();

        match describe_type {
            b'S' => {
                if !self.stmts.contains_key(&name) {
                    self.ext_err = Some(RiftError::Protocol(format!(
                        "prepared statement {:?} does not exist",
                        name
                    )));
                    return Ok(());
                }
                self.conn
                    .write_message(
                        MSG_PARAMETER_DESCRIPTION,
                        &messages::empty_parameter_description(),
                    )
                    .await?;
                // Row shapes are discovered at Execute time
                self.conn.write_message(MSG_NO_DATA, &[]).await?;
            }
            b'P' => {
                if !self.portals.contains_key(&name) {
                    self.ext_err = Some(RiftError::Protocol(format!(
                        "portal {:?} does not exist",
                        name
                    )));
                    return Ok(());
                }
                self.conn.write_message(MSG_NO_DATA, &[]).await?;
            }
            other => {
                self.ext_err = Some(RiftError::Protocol(format!(
                    "invalid describe type {:?}",
                    other as char
                )));
                return Ok(());
            }
        }

        self.conn.flush().await
    }

    async fn handle_execute(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = MessageBuf::from_bytes(payload);
        let portal_name = buf.get_cstr()?;
        // max_rows is read but partial execution is not supported
        let _max_rows = buf.get_i32().unwrap_or(0);

        let Some(portal) = self.portals.get(&portal_name) else {
            self.ext_err = Some(RiftError::Protocol(format!(
                "portal {:?} does not exist",
                portal_name
            )));
            return Ok(());
        };
        let portal = portal.clone();

        if portal.processed.rewritten_sql.is_empty() {
            return self
                .conn
                .write_message(MSG_EMPTY_QUERY_RESPONSE, &[])
                .await;
        }

        // Transaction control completes without ReadyForQuery; Sync sends it
        if is_begin(&portal.sql) {
            return self.handle_begin().await;
        }
        if is_commit(&portal.sql) {
            return self.handle_commit().await;
        }
        if is_rollback(&portal.sql) {
            return self.handle_rollback().await;
        }

        if let Err(e) = self.execute_processed(&portal.processed, &portal.params).await {
            self.ext_err = Some(e);
        }
        Ok(())
    }

    async fn handle_close(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= 2 {
            let close_type = payload[0];
            let mut buf = MessageBuf::from_bytes(&payload[1..]);
            let name = buf.get_cstr().unwrap_or_default();
            match close_type {
                b'S' => {
                    self.stmts.remove(&name);
                }
                b'P' => {
                    self.portals.remove(&name);
                }
                _ => {}
            }
        }

        self.conn.write_message(MSG_CLOSE_COMPLETE, &[]).await?;
        self.conn.flush().await
    }

    async fn handle_sync(&mut self) -> Result<()> {
        if let Some(err) = self.ext_err.take() {
            self.conn
                .send_error("ERROR", err.sqlstate(), &err.to_string())
                .await?;
        }
        self.conn.send_ready_for_query(self.tx_status).await
    }
}

fn executor_error(e: sqlx::Error) -> RiftError {
    match e {
        sqlx::Error::Database(db) => RiftError::Executor(db.message().to_string()),
        other => RiftError::Executor(other.to_string()),
    }
}

// ===== Statement helpers =====

pub(crate) fn is_begin(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    upper == "BEGIN"
        || upper.starts_with("BEGIN;")
        || upper == "START TRANSACTION"
        || upper.starts_with("START TRANSACTION;")
}

pub(crate) fn is_commit(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    upper == "COMMIT" || upper.starts_with("COMMIT;") || upper == "END" || upper.starts_with("END;")
}

pub(crate) fn is_rollback(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    upper == "ROLLBACK" || upper.starts_with("ROLLBACK;")
}

/// Split SQL on top-level semicolons, respecting single- and double-quoted
/// regions.
pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    let mut stmts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for c in sql.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    stmts.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        stmts.push(stmt.to_string());
    }

    stmts
}

/// Command tag for a statement given the upstream rows-affected count.
pub(crate) fn command_tag(stmt: &str, rows: u64) -> String {
    let keyword = stmt
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    match keyword.as_str() {
        "INSERT" => format!("INSERT 0 {}", rows),
        "UPDATE" => format!("UPDATE {}", rows),
        "DELETE" => format!("DELETE {}", rows),
        "SELECT" | "WITH" => format!("SELECT {}", rows),
        "" => "OK".to_string(),
        other => other.to_string(),
    }
}

// ===== Row encoding (text format) =====

/// RowDescription payload for a result row's columns.
fn describe_row(row: &PgRow) -> Vec<u8> {
    let fields: Vec<FieldDescription> = row
        .columns()
        .iter()
        .map(|col| {
            let type_name = col.type_info().name().to_string();
            FieldDescription {
                name: col.name().to_string(),
                type_oid: pg_type_oid(&type_name),
                type_size: pg_type_len(&type_name),
            }
        })
        .collect();
    messages::row_description(&fields)
}

/// Convert a row to per-column text values; None encodes SQL NULL.
fn encode_row(row: &PgRow) -> Vec<Option<String>> {
    (0..row.columns().len())
        .map(|i| encode_column(row, i))
        .collect()
}

fn encode_column(row: &PgRow, i: usize) -> Option<String> {
    let is_null = row
        .try_get_raw(i)
        .map(|raw| raw.is_null())
        .unwrap_or(true);
    if is_null {
        return None;
    }

    let type_name = row.columns()[i].type_info().name().to_uppercase();
    let value = match type_name.as_str() {
        "BOOL" => row
            .try_get::<bool, _>(i)
            .ok()
            .map(|v| if v { "t" } else { "f" }.to_string()),
        "INT2" => row.try_get::<i16, _>(i).ok().map(|v| v.to_string()),
        "INT4" => row.try_get::<i32, _>(i).ok().map(|v| v.to_string()),
        "INT8" | "OID" => row.try_get::<i64, _>(i).ok().map(|v| v.to_string()),
        "FLOAT4" => row.try_get::<f32, _>(i).ok().map(|v| v.to_string()),
        "FLOAT8" => row.try_get::<f64, _>(i).ok().map(|v| v.to_string()),
        "NUMERIC" => row
            .try_get::<sqlx::types::BigDecimal, _>(i)
            .ok()
            .map(|v| v.to_string()),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(i)
            .ok()
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
            .ok()
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(i)
            .ok()
            .map(|v| v.format("%Y-%m-%d").to_string()),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(i)
            .ok()
            .map(|v| v.format("%H:%M:%S%.6f").to_string()),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(i)
            .ok()
            .map(|v| format!("\\x{}", hex_encode(&v))),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(i)
            .ok()
            .map(|v| v.to_string()),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(i)
            .ok()
            .map(|v| v.to_string()),
        _ => row.try_get::<String, _>(i).ok(),
    };

    // Decode failures degrade to NULL rather than aborting the stream
    value
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
