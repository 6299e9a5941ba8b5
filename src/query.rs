//! Running tenant SQL inside a sandbox as the low-trust role.

use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Column, Decode, Row, Statement, TypeInfo, ValueRef};

use crate::config::ManagerConfig;
use crate::connection::{close, Connector};
use crate::error::SandboxError;
use crate::identity::DatabaseName;

/// Result of a tenant query. SQL errors are reported in `error`, not as a
/// failed request.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub truncated: bool,
}

/// Runs queries on a fresh low-trust connection per call.
#[derive(Debug, Clone)]
pub struct TenantQueries {
    connector: Connector,
    max_rows: usize,
}

impl TenantQueries {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            connector: Connector::new(config),
            max_rows: config.max_rows,
        }
    }

    /// Run `sql` in `database`. Only the first result set is returned, capped
    /// at the configured row limit.
    ///
    /// The statements go over the simple query protocol, so several can be
    /// sent at once and every value arrives in text form.
    pub async fn run(&self, database: &DatabaseName, sql: &str) -> Result<QueryOutput, SandboxError> {
        let mut conn = self.connector.tenant(database.as_str()).await?;
        let mut output = QueryOutput::default();
        {
            let mut rows = sqlx::Executor::fetch(&mut conn, sqlx::raw_sql(sql));
            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        let names = column_names(&row);
                        if output.rows.is_empty() && output.columns.is_empty() {
                            output.columns = names;
                        } else if names != output.columns {
                            break;
                        }
                        if output.rows.len() == self.max_rows {
                            output.truncated = true;
                            break;
                        }
                        output.rows.push(row_values(&row));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        output.error = Some(tenant_error(&e));
                        break;
                    }
                }
            }
        }
        if output.columns.is_empty() && output.error.is_none() && is_single_statement(sql) {
            // No row to read names from; ask the server for the row shape.
            if let Ok(stmt) = sqlx::Executor::prepare(&mut conn, sql).await {
                output.columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
            }
        }
        close(conn).await;
        Ok(output)
    }
}

/// Whether `sql` holds exactly one statement. Semicolons inside quotes or
/// `--` comments don't count; a trailing one is allowed.
fn is_single_statement(sql: &str) -> bool {
    let mut chars = sql.chars().peekable();
    let mut seen_end = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                if seen_end {
                    return false;
                }
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            ';' => seen_end = true,
            c if c.is_whitespace() => {}
            _ if seen_end => return false,
            _ => {}
        }
    }
    !sql.trim().is_empty()
}

fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn row_values(row: &PgRow) -> Vec<Value> {
    (0..row.len())
        .map(|i| {
            let Ok(raw) = row.try_get_raw(i) else {
                return Value::Null;
            };
            if raw.is_null() {
                return Value::Null;
            }
            let type_name = raw.type_info().name().to_string();
            match <&str as Decode<'_, Postgres>>::decode(raw) {
                Ok(text) => render_text(&type_name, text),
                Err(_) => Value::Null,
            }
        })
        .collect()
}

/// Turn a text-format Postgres value into JSON. Numbers and booleans keep
/// their type; everything else stays a string.
fn render_text(type_name: &str, text: &str) -> Value {
    let as_string = || Value::String(text.to_string());
    match type_name {
        "BOOL" => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => as_string(),
        },
        "INT2" | "INT4" | "INT8" | "OID" => text.parse::<i64>().map(Value::from).unwrap_or_else(|_| as_string()),
        "FLOAT4" | "FLOAT8" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(as_string),
        "JSON" | "JSONB" => serde_json::from_str(text).unwrap_or_else(|_| as_string()),
        _ => as_string(),
    }
}

// Tenant errors come back to the browser: keep the server's message for SQL
// errors, hide everything else.
fn tenant_error(e: &sqlx::Error) -> String {
    match e.as_database_error() {
        Some(db) => db.message().to_string(),
        None => "query failed".to_string(),
    }
}
