//! PostgreSQL adapter over tokio-postgres.
//!
//! Parameters are bound positionally (`$1..$N`). The statement is prepared
//! first so each JSON value can be coerced to the type the server inferred
//! for its placeholder.
//!
//! # Security
//!
//! Parameters travel as typed binary values through the extended query
//! protocol and are never interpolated into the statement text.

use std::borrow::Cow;
use std::error::Error;

use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use serde_json::{Map, Value as JsonValue};
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls};

use super::{Adapter, CancelHandle, CancelQuery, Connection};
use crate::backend::{BackendDescriptor, BackendKind, ConnectString};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::row::{Row, RowStream};
use crate::statement::append_returning;

/// Adapter for PostgreSQL backends.
pub struct PostgresAdapter {
    backend_id: String,
    connect: ConnectString,
}

impl PostgresAdapter {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            backend_id: descriptor.id.clone(),
            connect: descriptor.connect.clone(),
        }
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        let (client, connection) = tokio_postgres::connect(self.connect.expose(), NoTls)
            .await
            .map_err(|e| {
                AdapterError::connect(
                    &self.backend_id,
                    format!("Failed to connect to {}: {}", self.connect, describe(&e)),
                )
            })?;

        // The connection object drives the socket; it finishes when the client drops.
        let backend_id = self.backend_id.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(backend = %backend_id, error = %e, "PostgreSQL connection terminated");
            }
        });

        tracing::debug!(backend = %self.backend_id, "Opened PostgreSQL connection");
        Ok(Box::new(PostgresConnection {
            backend_id: self.backend_id.clone(),
            client,
            driver,
        }))
    }

    fn prepare_write<'s>(&self, statement: &'s str) -> Cow<'s, str> {
        append_returning(statement, &["INSERT", "UPDATE", "DELETE"])
    }
}

/// One PostgreSQL session.
pub struct PostgresConnection {
    backend_id: String,
    client: Client,
    driver: JoinHandle<()>,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(
        &mut self,
        statement: &str,
        params: &[JsonValue],
    ) -> Result<RowStream<'_>, AdapterError> {
        let prepared = self
            .client
            .prepare(statement)
            .await
            .map_err(|e| classify(&self.backend_id, &e))?;

        let values = bind_params(prepared.params(), params)
            .map_err(|cause| AdapterError::statement(&self.backend_id, cause))?;

        let rows = self
            .client
            .query_raw(&prepared, values.iter())
            .await
            .map_err(|e| classify(&self.backend_id, &e))?;

        let backend_id = self.backend_id.clone();
        Ok(Box::pin(
            rows.map_ok(|row| parse_pg_row(&row))
                .map_err(move |e| classify(&backend_id, &e)),
        ))
    }

    fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(PostgresCancel {
            backend_id: self.backend_id.clone(),
            token: self.client.cancel_token(),
        })
    }

    async fn health_check(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(self: Box<Self>) {
        let PostgresConnection {
            backend_id,
            client,
            driver,
        } = *self;
        drop(client);
        if driver.await.is_err() {
            tracing::debug!(backend = %backend_id, "PostgreSQL driver task ended abnormally");
        }
    }
}

/// Sends the protocol-level cancel request on a fresh socket.
struct PostgresCancel {
    backend_id: String,
    token: CancelToken,
}

#[async_trait]
impl CancelQuery for PostgresCancel {
    async fn cancel(&self) -> Result<(), AdapterError> {
        self.token
            .cancel_query(NoTls)
            .await
            .map_err(|e| AdapterError::io(&self.backend_id, format!("Cancel request failed: {}", e)))
    }
}

/// Formats the server-side detail of an error when there is one.
fn describe(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db_err| {
            format!(
                "{}: {} ({})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            )
        })
        .unwrap_or_else(|| e.to_string())
}

/// SQLSTATEs after which the session cannot be trusted.
fn is_fatal_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

fn classify(backend_id: &str, e: &tokio_postgres::Error) -> AdapterError {
    match e.as_db_error() {
        Some(db_err) => {
            let usable = !is_fatal_sqlstate(db_err.code().code());
            let kind = if usable {
                AdapterErrorKind::Backend
            } else {
                AdapterErrorKind::Io
            };
            AdapterError::new(backend_id, kind, usable, describe(e))
        }
        None => AdapterError::io(backend_id, e.to_string()),
    }
}

// ----------------------------------------------------------------------------
// Parameter binding
// ----------------------------------------------------------------------------

/// A JSON parameter coerced to the placeholder's server type.
#[derive(Debug, Clone, PartialEq)]
enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Json(JsonValue),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
}

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::Int2(v) => v.to_sql(ty, out),
            PgValue::Int4(v) => v.to_sql(ty, out),
            PgValue::Int8(v) => v.to_sql(ty, out),
            PgValue::Float4(v) => v.to_sql(ty, out),
            PgValue::Float8(v) => v.to_sql(ty, out),
            PgValue::Text(v) => v.to_sql(ty, out),
            PgValue::Json(v) => v.to_sql(ty, out),
            PgValue::Timestamp(v) => v.to_sql(ty, out),
            PgValue::TimestampTz(v) => v.to_sql(ty, out),
            PgValue::Date(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Coercion already matched the value to the placeholder type.
        true
    }

    to_sql_checked!();
}

fn bind_params(types: &[Type], params: &[JsonValue]) -> Result<Vec<PgValue>, String> {
    if types.len() != params.len() {
        return Err(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            params.len()
        ));
    }
    types
        .iter()
        .zip(params)
        .enumerate()
        .map(|(idx, (ty, value))| {
            coerce(ty, value).map_err(|reason| format!("parameter ${}: {}", idx + 1, reason))
        })
        .collect()
}

fn coerce(ty: &Type, value: &JsonValue) -> Result<PgValue, String> {
    if value.is_null() {
        return Ok(PgValue::Null);
    }

    let mismatch = || format!("cannot bind {} as {}", value, ty.name());
    let int = || value.as_i64().ok_or_else(mismatch);
    let float = || value.as_f64().ok_or_else(mismatch);
    let text = || value.as_str().ok_or_else(mismatch);

    let coerced = match *ty {
        Type::BOOL => PgValue::Bool(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => PgValue::Int2(i16::try_from(int()?).map_err(|_| mismatch())?),
        Type::INT4 => PgValue::Int4(i32::try_from(int()?).map_err(|_| mismatch())?),
        Type::INT8 => PgValue::Int8(int()?),
        Type::FLOAT4 => PgValue::Float4(float()? as f32),
        Type::FLOAT8 => PgValue::Float8(float()?),
        Type::JSON | Type::JSONB => PgValue::Json(value.clone()),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            PgValue::Text(match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
        Type::TIMESTAMPTZ => PgValue::TimestampTz(
            DateTime::parse_from_rfc3339(text()?)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc),
        ),
        Type::TIMESTAMP => PgValue::Timestamp(
            text()?
                .parse::<NaiveDateTime>()
                .map_err(|e| e.to_string())?,
        ),
        Type::DATE => PgValue::Date(text()?.parse::<NaiveDate>().map_err(|e| e.to_string())?),
        _ => {
            return Err(format!(
                "unsupported parameter type {}; cast the placeholder (e.g. $1::text::{})",
                ty.name(),
                ty.name()
            ))
        }
    };
    Ok(coerced)
}

// ----------------------------------------------------------------------------
// Row decoding
// ----------------------------------------------------------------------------

/// Parses a PostgreSQL row into a Row, keeping column order.
///
/// Standard types are converted to their JSON equivalents. Values that fail
/// to decode become null.
fn parse_pg_row(pg_row: &tokio_postgres::Row) -> Row {
    let mut data = Map::with_capacity(pg_row.len());

    for (idx, column) in pg_row.columns().iter().enumerate() {
        let value = match column.type_().name() {
            "int2" => pg_row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into())),
            "int4" => pg_row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into())),
            "int8" => pg_row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into())),
            "oid" => pg_row
                .try_get::<_, Option<u32>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into())),
            "float4" => pg_row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(JsonValue::Number),
            "float8" => pg_row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number),
            "numeric" => pg_row
                .try_get::<_, Option<PgNumeric>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.0)),
            "bool" => pg_row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool),
            "json" | "jsonb" => pg_row.try_get::<_, Option<JsonValue>>(idx).ok().flatten(),
            "timestamptz" => pg_row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.to_rfc3339())),
            "timestamp" => pg_row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.to_string())),
            "date" => pg_row
                .try_get::<_, Option<NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.to_string())),
            "time" => pg_row
                .try_get::<_, Option<NaiveTime>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.to_string())),
            "bytea" => pg_row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(base64::engine::general_purpose::STANDARD.encode(v))),
            "_text" | "_varchar" => pg_row
                .try_get::<_, Option<Vec<String>>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Array(v.into_iter().map(JsonValue::String).collect())),
            "_int4" => pg_row
                .try_get::<_, Option<Vec<i32>>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Array(v.into_iter().map(JsonValue::from).collect())),
            "_int8" => pg_row
                .try_get::<_, Option<Vec<i64>>>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Array(v.into_iter().map(JsonValue::from).collect())),
            // text, varchar, name, bpchar and anything else with a text-compatible decoding
            _ => pg_row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(JsonValue::String),
        };

        data.insert(column.name().to_string(), value.unwrap_or(JsonValue::Null));
    }

    Row::new(data)
}

/// NUMERIC decoded from its binary form into an exact decimal string.
#[derive(Debug, PartialEq)]
struct PgNumeric(String);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        // Header: ndigits, weight, sign, dscale; then ndigits base-10000 digits.
        let word = |i: usize| -> Result<u16, Box<dyn Error + Sync + Send>> {
            raw.get(i * 2..i * 2 + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric".into())
        };
        let ndigits = word(0)? as usize;
        let weight = word(1)? as i16 as i32;
        let sign = word(2)?;
        let dscale = word(3)? as usize;

        if sign == NUMERIC_NAN {
            return Ok(PgNumeric("NaN".to_string()));
        }

        let digits = (0..ndigits)
            .map(|i| word(4 + i))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = String::new();
        if sign == NUMERIC_NEG {
            out.push('-');
        }

        // Integer part: groups 0..=weight
        if weight < 0 {
            out.push('0');
        } else {
            for group in 0..=weight as usize {
                let d = digits.get(group).copied().unwrap_or(0);
                if group == 0 {
                    out.push_str(&d.to_string());
                } else {
                    out.push_str(&format!("{:04}", d));
                }
            }
        }

        if dscale > 0 {
            let mut frac = String::new();
            let first_frac_group = weight + 1;
            let mut group = first_frac_group;
            while frac.len() < dscale {
                let d = if group < 0 {
                    0
                } else {
                    digits.get(group as usize).copied().unwrap_or(0)
                };
                frac.push_str(&format!("{:04}", d));
                group += 1;
            }
            frac.truncate(dscale);
            out.push('.');
            out.push_str(&frac);
        }

        Ok(PgNumeric(out))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
