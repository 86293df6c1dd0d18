use crate::errors::{AppError, AppResult};
use crate::models::TenantId;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));

const PROGRESS_HANDLER_OPS: i32 = 1_000;

/// Rejects anything that is not a plain SQL identifier. Every table, schema
/// and model name interpolated into SQL passes through here first.
pub fn validate_identifier(name: &str) -> AppResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("'{}' is not a valid SQL identifier", name)))
    }
}

/// Substitutes tenant placeholders in a model body.
///
/// `{{schema}}` becomes the tenant schema name and `{{tenant_id}}` the numeric
/// id. This is the only place tenant scoping is applied to SQL text.
pub fn render_query(body: &str, tenant_id: TenantId) -> String {
    body.replace("{{schema}}", &tenant_id.schema_name())
        .replace("{{tenant_id}}", &tenant_id.0.to_string())
}

fn strip_trailing_semicolons(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Directory of per-tenant warehouse files.
#[derive(Debug, Clone)]
pub struct Warehouse {
    root: PathBuf,
}

impl Warehouse {
    pub fn new(root: &Path) -> AppResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn tenant_path(&self, tenant_id: TenantId) -> PathBuf {
        self.root.join(format!("{}.sqlite", tenant_id.schema_name()))
    }

    /// Opens a fresh connection with exactly one tenant schema attached.
    pub fn open_session(&self, tenant_id: TenantId) -> AppResult<TenantSession> {
        let schema = tenant_id.schema_name();
        validate_identifier(&schema)?;

        let conn = Connection::open_in_memory()?;
        let path = self.tenant_path(tenant_id);
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", schema),
            [path.to_string_lossy().as_ref()],
        )?;

        tracing::debug!(tenant_id = %tenant_id, path = %path.display(), "attached tenant warehouse");

        Ok(TenantSession {
            conn,
            tenant_id,
            schema,
        })
    }

    pub fn list_tables(&self, tenant_id: TenantId) -> AppResult<Vec<String>> {
        if !self.tenant_path(tenant_id).exists() {
            return Ok(Vec::new());
        }
        self.open_session(tenant_id)?.list_tables()
    }
}

/// Connection scoped to a single tenant schema for the duration of a run.
/// The schema is detached when the session is dropped.
pub struct TenantSession {
    conn: Connection,
    tenant_id: TenantId,
    schema: String,
}

impl TenantSession {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn qualified(&self, table: &str) -> AppResult<String> {
        validate_identifier(table)?;
        Ok(format!("{}.{}", self.schema, table))
    }

    pub fn render(&self, body: &str) -> String {
        render_query(body, self.tenant_id)
    }

    /// Installs a deadline after which running statements are interrupted.
    /// `None` removes it.
    pub fn set_statement_timeout(&self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                self.conn
                    .progress_handler(PROGRESS_HANDLER_OPS, Some(move || Instant::now() >= deadline));
            }
            None => self.conn.progress_handler(PROGRESS_HANDLER_OPS, None::<fn() -> bool>),
        }
    }

    fn relation_kind(&self, name: &str) -> AppResult<Option<String>> {
        let kind = self
            .conn
            .query_row(
                &format!(
                    "SELECT type FROM {}.sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
                    self.schema
                ),
                [name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(map_statement_error)?;
        Ok(kind)
    }

    pub fn table_exists(&self, table: &str) -> AppResult<bool> {
        validate_identifier(table)?;
        Ok(self.relation_kind(table)?.is_some())
    }

    /// Replaces `table` with the result of `query` and returns its row count.
    /// The drop and create share a transaction, so a failing query leaves the
    /// previous table in place.
    pub fn materialize(&self, table: &str, query: &str) -> AppResult<i64> {
        let qualified = self.qualified(table)?;
        let query = strip_trailing_semicolons(query);

        let tx = self.conn.unchecked_transaction().map_err(map_statement_error)?;
        let drop_sql = match self.relation_kind(table)?.as_deref() {
            Some("view") => format!("DROP VIEW IF EXISTS {}", qualified),
            _ => format!("DROP TABLE IF EXISTS {}", qualified),
        };
        tx.execute_batch(&drop_sql).map_err(map_statement_error)?;
        tx.execute(&format!("CREATE TABLE {} AS {}", qualified, query), [])
            .map_err(map_statement_error)?;
        let rows: i64 = tx
            .query_row(&format!("SELECT COUNT(*) FROM {}", qualified), [], |row| row.get(0))
            .map_err(map_statement_error)?;
        tx.commit().map_err(map_statement_error)?;

        Ok(rows)
    }

    /// Runs a model body that manages its own objects, for example `CREATE VIEW`.
    pub fn execute_statement(&self, sql: &str) -> AppResult<()> {
        self.conn.execute_batch(sql).map_err(map_statement_error)
    }

    pub fn list_tables(&self) -> AppResult<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name FROM {}.sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
            self.schema
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Reads every row of a query as a JSON object keyed by column name.
    pub fn query_json(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> AppResult<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let mut rows = stmt.query(params)?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = serde_json::Map::new();
            for (index, column) in columns.iter().enumerate() {
                object.insert(column.clone(), value_to_json(row.get_ref(index)?));
            }
            result.push(serde_json::Value::Object(object));
        }
        Ok(result)
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        self.conn.progress_handler(PROGRESS_HANDLER_OPS, None::<fn() -> bool>);
        if let Err(error) = self.conn.execute_batch(&format!("DETACH DATABASE {}", self.schema)) {
            tracing::warn!(tenant_id = %self.tenant_id, error = %error, "failed to detach tenant warehouse");
        }
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(value) => serde_json::Value::from(value),
        ValueRef::Real(value) => serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn map_statement_error(error: rusqlite::Error) -> AppError {
    match error.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => {
            AppError::Internal("statement interrupted: model execution timed out".to_string())
        }
        _ => AppError::from(error),
    }
}
