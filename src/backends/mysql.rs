//! MySQL adapter over mysql_async.
//!
//! Statements run through the binary protocol with `?` placeholders. The
//! session type here is shared with the MariaDB adapter; the two differ in
//! which server error codes end a session and in write rewrites.

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Params};
use serde_json::{Map, Value as JsonValue};

use super::{mariadb, Adapter, CancelHandle, CancelQuery, Connection};
use crate::backend::{BackendDescriptor, BackendKind, ConnectString};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::row::{Row, RowStream};

/// Server shutdown in progress.
const ER_SERVER_SHUTDOWN: u16 = 1053;
/// Aborted connection.
const ER_ABORTING_CONNECTION: u16 = 1152;
/// Aborted connection during new-connection handling.
const ER_NEW_ABORTING_CONNECTION: u16 = 1184;

/// Which member of the MySQL protocol family a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    MySql,
    MariaDb,
}

impl Flavor {
    /// Server error codes after which the session cannot be reused.
    pub fn is_fatal_server_code(self, code: u16) -> bool {
        let common = matches!(
            code,
            ER_SERVER_SHUTDOWN | ER_ABORTING_CONNECTION | ER_NEW_ABORTING_CONNECTION
        );
        match self {
            Flavor::MySql => common,
            Flavor::MariaDb => common || mariadb::is_fatal_server_code(code),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Flavor::MySql => "MySQL",
            Flavor::MariaDb => "MariaDB",
        }
    }

    /// Maps a driver error onto the adapter taxonomy.
    pub fn classify(self, backend_id: &str, e: &mysql_async::Error) -> AdapterError {
        match e {
            mysql_async::Error::Server(server) => {
                let usable = !self.is_fatal_server_code(server.code);
                let kind = if usable {
                    AdapterErrorKind::Backend
                } else {
                    AdapterErrorKind::Io
                };
                AdapterError::new(
                    backend_id,
                    kind,
                    usable,
                    format!("{} ({}): {}", server.code, server.state, server.message),
                )
            }
            mysql_async::Error::Url(url) => {
                AdapterError::connect(backend_id, format!("Invalid connection string: {}", url))
            }
            other => AdapterError::io(backend_id, other.to_string()),
        }
    }
}

/// Opens a MySQL-family session for the given flavor.
pub(super) async fn open(
    backend_id: &str,
    connect: &ConnectString,
    flavor: Flavor,
) -> Result<Box<dyn Connection>, AdapterError> {
    let opts = Opts::from_url(connect.expose()).map_err(|e| {
        AdapterError::connect(backend_id, format!("Invalid connection string: {}", e))
    })?;

    let conn = Conn::new(opts.clone()).await.map_err(|e| {
        let cause = format!("Failed to connect to {}: {}", connect, e);
        AdapterError::connect(backend_id, cause)
    })?;

    tracing::debug!(
        backend = %backend_id,
        connection_id = conn.id(),
        "Opened {} connection",
        flavor.label()
    );
    Ok(Box::new(MySqlConnection {
        backend_id: backend_id.to_string(),
        conn,
        opts,
        flavor,
    }))
}

/// Adapter for MySQL backends.
pub struct MySqlAdapter {
    backend_id: String,
    connect: ConnectString,
}

impl MySqlAdapter {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            backend_id: descriptor.id.clone(),
            connect: descriptor.connect.clone(),
        }
    }
}

#[async_trait]
impl Adapter for MySqlAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        open(&self.backend_id, &self.connect, Flavor::MySql).await
    }
}

/// One MySQL or MariaDB session.
pub struct MySqlConnection {
    backend_id: String,
    conn: Conn,
    opts: Opts,
    flavor: Flavor,
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(
        &mut self,
        statement: &str,
        params: &[JsonValue],
    ) -> Result<RowStream<'_>, AdapterError> {
        let values: Vec<mysql_async::Value> = params.iter().map(json_to_mysql).collect();
        let params = if values.is_empty() {
            Params::Empty
        } else {
            Params::Positional(values)
        };

        let flavor = self.flavor;
        let backend_id = self.backend_id.clone();
        let mut result = self
            .conn
            .exec_iter(statement.to_string(), params)
            .await
            .map_err(|e| flavor.classify(&backend_id, &e))?;

        Ok(Box::pin(try_stream! {
            while let Some(row) = result.next().await.map_err(|e| flavor.classify(&backend_id, &e))? {
                yield mysql_row(row);
            }
        }))
    }

    fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(KillQuery {
            backend_id: self.backend_id.clone(),
            opts: self.opts.clone(),
            connection_id: self.conn.id(),
        })
    }

    async fn health_check(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    async fn close(self: Box<Self>) {
        let MySqlConnection {
            backend_id, conn, ..
        } = *self;
        if let Err(e) = conn.disconnect().await {
            tracing::debug!(backend = %backend_id, error = %e, "Disconnect failed");
        }
    }
}

/// Aborts a running statement by issuing `KILL QUERY` from a side connection.
struct KillQuery {
    backend_id: String,
    opts: Opts,
    connection_id: u32,
}

#[async_trait]
impl CancelQuery for KillQuery {
    async fn cancel(&self) -> Result<(), AdapterError> {
        let fail = |e: mysql_async::Error| {
            AdapterError::io(&self.backend_id, format!("KILL QUERY failed: {}", e))
        };
        let mut side = Conn::new(self.opts.clone()).await.map_err(fail)?;
        side.query_drop(format!("KILL QUERY {}", self.connection_id))
            .await
            .map_err(fail)?;
        side.disconnect().await.map_err(fail)
    }
}

/// Converts a JSON parameter to a MySQL value.
fn json_to_mysql(value: &JsonValue) -> mysql_async::Value {
    match value {
        JsonValue::Null => mysql_async::Value::NULL,
        JsonValue::Bool(b) => mysql_async::Value::Int(i64::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                mysql_async::Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                mysql_async::Value::UInt(u)
            } else {
                mysql_async::Value::Double(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        // Arrays and objects are bound as JSON text
        other => mysql_async::Value::Bytes(other.to_string().into_bytes()),
    }
}

/// Converts a MySQL result value to JSON.
///
/// DECIMAL arrives as text and stays a string. Binary data that is not UTF-8
/// is base64-encoded.
fn mysql_to_json(value: mysql_async::Value) -> JsonValue {
    match value {
        mysql_async::Value::NULL => JsonValue::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => JsonValue::String(s),
            Err(e) => JsonValue::String(
                base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            ),
        },
        mysql_async::Value::Int(n) => JsonValue::from(n),
        mysql_async::Value::UInt(n) => JsonValue::from(n),
        mysql_async::Value::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        mysql_async::Value::Double(d) => serde_json::Number::from_f64(d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let date = format!("{:04}-{:02}-{:02}", year, month, day);
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                JsonValue::String(date)
            } else if micro == 0 {
                JsonValue::String(format!("{} {:02}:{:02}:{:02}", date, hour, min, sec))
            } else {
                JsonValue::String(format!(
                    "{} {:02}:{:02}:{:02}.{:06}",
                    date, hour, min, sec, micro
                ))
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            let hours = days * 24 + u32::from(hour);
            let sign = if neg { "-" } else { "" };
            if micro == 0 {
                JsonValue::String(format!("{}{:02}:{:02}:{:02}", sign, hours, min, sec))
            } else {
                JsonValue::String(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, min, sec, micro
                ))
            }
        }
    }
}

fn mysql_row(mut row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();

    let mut data = Map::with_capacity(columns.len());
    for (idx, name) in columns.into_iter().enumerate() {
        let value: mysql_async::Value = row.take(idx).unwrap_or(mysql_async::Value::NULL);
        data.insert(name, mysql_to_json(value));
    }
    Row::new(data)
}
