//! Read-only SQLite inspector
//!
//! Lets the hub browse databases the host registered, strictly read-only:
//! read-only open flags, identifier validation, a SELECT-only query gate
//! and a hard interrupt for runaway statements. Databases registered as
//! sensitive refuse all inspection.

use crate::bridge::{DbCommand, DbCommandKind, DbResponse};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_QUERY_ROWS: usize = 1_000;
const MAX_PAGE_SIZE: u32 = 500;
const MAX_IDENTIFIER_LEN: usize = 128;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex compiles"));

const FORBIDDEN_TOKENS: [&str; 8] = [
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "ATTACH", "DETACH",
];

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum DbInspectorError {
    #[error("database not found")]
    DatabaseNotFound,
    #[error("table not found")]
    TableNotFound,
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("query timed out")]
    Timeout,
    #[error("access denied")]
    AccessDenied,
    #[error("internal error: {0}")]
    Internal(String),
}

/// A database the host has offered for inspection
#[derive(Debug, Clone)]
pub struct RegisteredDb {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub sensitive: bool,
}

pub struct DbInspector {
    databases: RwLock<Vec<RegisteredDb>>,
}

impl Default for DbInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl DbInspector {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(Vec::new()),
        }
    }

    pub fn register_database(&self, db: RegisteredDb) {
        let mut databases = self.databases.write().expect("inspector lock poisoned");
        databases.retain(|d| d.id != db.id);
        databases.push(db);
    }

    pub fn unregister_database(&self, id: &str) {
        let mut databases = self.databases.write().expect("inspector lock poisoned");
        databases.retain(|d| d.id != id);
    }

    fn find(&self, id: Option<&str>) -> Result<RegisteredDb, DbInspectorError> {
        let databases = self.databases.read().expect("inspector lock poisoned");
        let id = id.ok_or(DbInspectorError::DatabaseNotFound)?;
        let db = databases
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(DbInspectorError::DatabaseNotFound)?;
        if db.sensitive {
            return Err(DbInspectorError::AccessDenied);
        }
        Ok(db)
    }

    /// Execute one hub command and wrap the outcome in a `dbResponse`.
    pub async fn execute(&self, command: DbCommand) -> DbResponse {
        let request_id = command.request_id.clone();
        let result = match command.kind {
            DbCommandKind::ListDatabases => Ok(self.list_databases()),
            DbCommandKind::ListTables => match self.find(command.db_id.as_deref()) {
                Ok(db) => list_tables(db).await,
                Err(e) => Err(e),
            },
            DbCommandKind::DescribeTable => match self.find(command.db_id.as_deref()) {
                Ok(db) => describe_table(db, command.table.as_deref()).await,
                Err(e) => Err(e),
            },
            DbCommandKind::FetchTablePage => match self.find(command.db_id.as_deref()) {
                Ok(db) => {
                    fetch_table_page(
                        db,
                        command.table.as_deref(),
                        command.page,
                        command.page_size,
                        command.order_by.as_deref(),
                        command.ascending.unwrap_or(true),
                    )
                    .await
                }
                Err(e) => Err(e),
            },
            DbCommandKind::ExecuteQuery => match self.find(command.db_id.as_deref()) {
                Ok(db) => execute_query(db, command.query.as_deref()).await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(payload) => DbResponse {
                request_id,
                success: true,
                payload: Some(payload),
                error: None,
            },
            Err(error) => DbResponse {
                request_id,
                success: false,
                payload: None,
                error: Some(error),
            },
        }
    }

    fn list_databases(&self) -> Value {
        let databases = self.databases.read().expect("inspector lock poisoned");
        json!({
            "databases": databases
                .iter()
                .map(|d| json!({ "id": d.id, "name": d.name, "sensitive": d.sensitive }))
                .collect::<Vec<_>>()
        })
    }
}

fn validate_identifier(name: Option<&str>) -> Result<String, DbInspectorError> {
    let name = name.ok_or_else(|| DbInspectorError::InvalidQuery("missing identifier".to_string()))?;
    if name.len() > MAX_IDENTIFIER_LEN || !IDENTIFIER.is_match(name) {
        return Err(DbInspectorError::InvalidQuery(format!(
            "invalid identifier: {name}"
        )));
    }
    Ok(name.to_string())
}

fn validate_select(query: Option<&str>) -> Result<String, DbInspectorError> {
    let query = query.ok_or_else(|| DbInspectorError::InvalidQuery("missing query".to_string()))?;
    let upper = query.trim().to_uppercase();
    if !upper.starts_with("SELECT") {
        return Err(DbInspectorError::InvalidQuery(
            "only SELECT statements are allowed".to_string(),
        ));
    }
    for token in FORBIDDEN_TOKENS {
        if upper.contains(token) {
            return Err(DbInspectorError::InvalidQuery(format!(
                "forbidden keyword {token}"
            )));
        }
    }
    Ok(query.to_string())
}

fn open_read_only(db: &RegisteredDb) -> Result<Connection, DbInspectorError> {
    let conn = Connection::open_with_flags(
        &db.path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|_| DbInspectorError::DatabaseNotFound)?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| DbInspectorError::Internal(e.to_string()))?;
    Ok(conn)
}

fn map_sqlite_error(e: rusqlite::Error) -> DbInspectorError {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::OperationInterrupted =>
        {
            DbInspectorError::Timeout
        }
        _ => DbInspectorError::Internal(e.to_string()),
    }
}

/// Run `op` on a blocking thread with the 10-second interrupt armed.
async fn with_connection<F>(db: RegisteredDb, op: F) -> Result<Value, DbInspectorError>
where
    F: FnOnce(&Connection) -> Result<Value, DbInspectorError> + Send + 'static,
{
    let conn = open_read_only(&db)?;
    let interrupt = conn.get_interrupt_handle();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(QUERY_TIMEOUT).await;
        interrupt.interrupt();
    });

    let result = tokio::task::spawn_blocking(move || op(&conn))
        .await
        .map_err(|e| DbInspectorError::Internal(e.to_string()))?;
    watchdog.abort();
    result
}

async fn list_tables(db: RegisteredDb) -> Result<Value, DbInspectorError> {
    with_connection(db, |conn| {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(map_sqlite_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlite_error)?;
        Ok(json!({ "tables": names }))
    })
    .await
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, DbInspectorError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .map_err(map_sqlite_error)
}

async fn describe_table(
    db: RegisteredDb,
    table: Option<&str>,
) -> Result<Value, DbInspectorError> {
    let table = validate_identifier(table)?;
    with_connection(db, move |conn| {
        if !table_exists(conn, &table)? {
            return Err(DbInspectorError::TableNotFound);
        }
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info(\"{table}\")"))
            .map_err(map_sqlite_error)?;
        let columns = stmt
            .query_map([], |row| {
                Ok(json!({
                    "name": row.get::<_, String>(1)?,
                    "type": row.get::<_, String>(2)?,
                    "notNull": row.get::<_, i64>(3)? != 0,
                    "defaultValue": row.get::<_, Option<String>>(4)?,
                    "primaryKey": row.get::<_, i64>(5)? != 0,
                }))
            })
            .map_err(map_sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlite_error)?;
        Ok(json!({ "table": table, "columns": columns }))
    })
    .await
}

async fn fetch_table_page(
    db: RegisteredDb,
    table: Option<&str>,
    page: Option<u32>,
    page_size: Option<u32>,
    order_by: Option<&str>,
    ascending: bool,
) -> Result<Value, DbInspectorError> {
    let table = validate_identifier(table)?;
    let order_by = match order_by {
        Some(col) => Some(validate_identifier(Some(col))?),
        None => None,
    };
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);

    with_connection(db, move |conn| {
        if !table_exists(conn, &table)? {
            return Err(DbInspectorError::TableNotFound);
        }
        let total: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get(0)
            })
            .map_err(map_sqlite_error)?;

        let order_clause = match &order_by {
            Some(col) => format!(
                "ORDER BY \"{col}\" {}",
                if ascending { "ASC" } else { "DESC" }
            ),
            None => String::new(),
        };
        let offset = (page as i64 - 1) * page_size as i64;
        let sql = format!(
            "SELECT * FROM \"{table}\" {order_clause} LIMIT {page_size} OFFSET {offset}"
        );
        let (columns, rows) = collect_rows(conn, &sql, usize::MAX)?;
        Ok(json!({
            "columns": columns,
            "rows": rows,
            "total": total,
            "page": page,
            "pageSize": page_size,
        }))
    })
    .await
}

async fn execute_query(db: RegisteredDb, query: Option<&str>) -> Result<Value, DbInspectorError> {
    let query = validate_select(query)?;
    with_connection(db, move |conn| {
        let (columns, rows) = collect_rows(conn, &query, MAX_QUERY_ROWS)?;
        let row_count = rows.len();
        let truncated = row_count == MAX_QUERY_ROWS;
        Ok(json!({
            "columns": columns,
            "rows": rows,
            "rowCount": row_count,
            "truncated": truncated,
        }))
    })
    .await
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
) -> Result<(Vec<String>, Vec<Vec<Value>>), DbInspectorError> {
    let mut stmt = conn.prepare(sql).map_err(|e| match e {
        rusqlite::Error::SqliteFailure(_, Some(ref msg)) if msg.contains("no such table") => {
            DbInspectorError::TableNotFound
        }
        other => map_sqlite_error(other),
    })?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut raw = stmt.query([]).map_err(map_sqlite_error)?;
    while let Some(row) = raw.next().map_err(map_sqlite_error)? {
        if rows.len() >= max_rows {
            break;
        }
        let mut out = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = match row.get_ref(idx).map_err(map_sqlite_error)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => json!(i),
                ValueRef::Real(f) => json!(f),
                ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                ValueRef::Blob(b) => {
                    use base64::{engine::general_purpose, Engine as _};
                    json!(general_purpose::STANDARD.encode(b))
                }
            };
            out.push(value);
        }
        rows.push(out);
    }
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded_db(dir: &std::path::Path, rows: usize) -> PathBuf {
        let path = dir.join("app.sqlite");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT NOT NULL, qty INTEGER);",
        )
        .expect("schema");
        for i in 0..rows {
            conn.execute(
                "INSERT INTO orders (item, qty) VALUES (?1, ?2)",
                rusqlite::params![format!("item-{i}"), i as i64],
            )
            .expect("insert");
        }
        path
    }

    fn inspector_with(path: PathBuf, sensitive: bool) -> DbInspector {
        let inspector = DbInspector::new();
        inspector.register_database(RegisteredDb {
            id: "main".to_string(),
            name: "app".to_string(),
            path,
            sensitive,
        });
        inspector
    }

    fn command(kind: DbCommandKind) -> DbCommand {
        DbCommand {
            request_id: "req".to_string(),
            kind,
            db_id: Some("main".to_string()),
            table: None,
            page: None,
            page_size: None,
            order_by: None,
            ascending: None,
            query: None,
        }
    }

    #[tokio::test]
    async fn forbidden_query_is_rejected_with_the_keyword() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 3), false);

        let mut cmd = command(DbCommandKind::ExecuteQuery);
        cmd.query = Some("select * from orders; drop table orders;".to_string());
        let response = inspector.execute(cmd).await;
        assert!(!response.success);
        match response.error.expect("error") {
            DbInspectorError::InvalidQuery(msg) => assert!(msg.contains("DROP"), "message: {msg}"),
            other => panic!("expected invalid query, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mixed_case_select_with_whitespace_is_accepted() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 3), false);

        let mut cmd = command(DbCommandKind::ExecuteQuery);
        cmd.query = Some("   SeLeCt item, qty FROM orders WHERE qty >= 1".to_string());
        let response = inspector.execute(cmd).await;
        assert!(response.success, "error: {:?}", response.error);
        let payload = response.payload.expect("payload");
        assert_eq!(payload["rowCount"], 2);
        assert_eq!(payload["columns"][0], "item");
    }

    #[tokio::test]
    async fn query_rows_are_capped() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 1100), false);

        let mut cmd = command(DbCommandKind::ExecuteQuery);
        cmd.query = Some("SELECT * FROM orders".to_string());
        let response = inspector.execute(cmd).await;
        let payload = response.payload.expect("payload");
        assert_eq!(payload["rowCount"], 1000);
        assert_eq!(payload["truncated"], true);
    }

    #[tokio::test]
    async fn page_and_page_size_are_clamped() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 10), false);

        let mut cmd = command(DbCommandKind::FetchTablePage);
        cmd.table = Some("orders".to_string());
        cmd.page = Some(0);
        cmd.page_size = Some(0);
        let response = inspector.execute(cmd).await;
        assert!(response.success, "error: {:?}", response.error);
        let payload = response.payload.expect("payload");
        assert_eq!(payload["page"], 1);
        assert_eq!(payload["pageSize"], 1);
        assert_eq!(payload["total"], 10);
        assert_eq!(payload["rows"].as_array().expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn table_page_orders_by_validated_column() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 5), false);

        let mut cmd = command(DbCommandKind::FetchTablePage);
        cmd.table = Some("orders".to_string());
        cmd.order_by = Some("qty".to_string());
        cmd.ascending = Some(false);
        let response = inspector.execute(cmd).await;
        let payload = response.payload.expect("payload");
        let rows = payload["rows"].as_array().expect("rows");
        assert_eq!(rows[0][2], 4);

        // An injection-shaped order column is rejected.
        let mut bad = command(DbCommandKind::FetchTablePage);
        bad.table = Some("orders".to_string());
        bad.order_by = Some("qty; drop table orders".to_string());
        let response = inspector.execute(bad).await;
        assert!(matches!(
            response.error,
            Some(DbInspectorError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn sensitive_databases_refuse_everything() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 3), true);

        for kind in [
            DbCommandKind::ListTables,
            DbCommandKind::DescribeTable,
            DbCommandKind::FetchTablePage,
            DbCommandKind::ExecuteQuery,
        ] {
            let mut cmd = command(kind);
            cmd.table = Some("orders".to_string());
            cmd.query = Some("SELECT 1".to_string());
            let response = inspector.execute(cmd).await;
            assert_eq!(response.error, Some(DbInspectorError::AccessDenied));
        }

        // Listing still shows the database with its flag.
        let response = inspector.execute(command(DbCommandKind::ListDatabases)).await;
        let payload = response.payload.expect("payload");
        assert_eq!(payload["databases"][0]["sensitive"], true);
    }

    #[tokio::test]
    async fn unknown_database_and_table_report_cleanly() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 1), false);

        let mut cmd = command(DbCommandKind::ListTables);
        cmd.db_id = Some("nope".to_string());
        let response = inspector.execute(cmd).await;
        assert_eq!(response.error, Some(DbInspectorError::DatabaseNotFound));

        let mut cmd = command(DbCommandKind::DescribeTable);
        cmd.table = Some("missing".to_string());
        let response = inspector.execute(cmd).await;
        assert_eq!(response.error, Some(DbInspectorError::TableNotFound));
    }

    #[tokio::test]
    async fn describe_table_reports_schema() {
        let dir = tempdir().expect("temp dir");
        let inspector = inspector_with(seeded_db(dir.path(), 1), false);

        let mut cmd = command(DbCommandKind::DescribeTable);
        cmd.table = Some("orders".to_string());
        let response = inspector.execute(cmd).await;
        let payload = response.payload.expect("payload");
        let columns = payload["columns"].as_array().expect("columns");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0]["name"], "id");
        assert_eq!(columns[0]["primaryKey"], true);
        assert_eq!(columns[1]["notNull"], true);
    }

    #[test]
    fn identifier_rules() {
        assert!(validate_identifier(Some("orders")).is_ok());
        assert!(validate_identifier(Some("_private2")).is_ok());
        assert!(validate_identifier(Some("1table")).is_err());
        assert!(validate_identifier(Some("bad-name")).is_err());
        assert!(validate_identifier(Some(&"x".repeat(129))).is_err());
        assert!(validate_identifier(None).is_err());
    }
}
