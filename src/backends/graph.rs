//! Graph adapter over the neo4rs Bolt driver.
//!
//! Positional parameters are exposed to Cypher as `$p1..$pN`. Nodes and
//! relationships are flattened into JSON objects carrying their labels or
//! type alongside their properties.

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    ConfigBuilder, Graph,
};
use serde_json::{Map, Value as JsonValue};

use super::{Adapter, CancelHandle, Connection};
use crate::backend::{BackendDescriptor, BackendKind, ConnectString};
use crate::error::AdapterError;
use crate::row::{Row, RowStream};

/// Adapter for Bolt-speaking graph backends.
pub struct GraphAdapter {
    backend_id: String,
    connect: ConnectString,
    user: String,
    password: String,
    database: Option<String>,
}

impl GraphAdapter {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        let (user, password) = descriptor
            .credentials
            .as_ref()
            .map(|c| (c.user.clone(), c.password.clone()))
            .unwrap_or_default();
        Self {
            backend_id: descriptor.id.clone(),
            connect: descriptor.connect.clone(),
            user,
            password,
            database: descriptor.database.clone(),
        }
    }
}

#[async_trait]
impl Adapter for GraphAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        // One Bolt session per pooled connection; the gateway pool does the pooling.
        let mut builder = ConfigBuilder::default()
            .uri(self.connect.expose())
            .user(self.user.as_str())
            .password(self.password.as_str())
            .max_connections(1);
        if let Some(database) = &self.database {
            builder = builder.db(database.as_str());
        }

        let config = builder.build().map_err(|e| {
            AdapterError::connect(&self.backend_id, format!("Invalid graph configuration: {}", e))
        })?;
        let graph = Graph::connect(config).await.map_err(|e| {
            AdapterError::connect(
                &self.backend_id,
                format!("Failed to connect to {}: {}", self.connect, e),
            )
        })?;

        tracing::debug!(backend = %self.backend_id, "Opened graph connection");
        Ok(Box::new(GraphConnection {
            backend_id: self.backend_id.clone(),
            graph,
        }))
    }
}

/// One Bolt session.
pub struct GraphConnection {
    backend_id: String,
    graph: Graph,
}

#[async_trait]
impl Connection for GraphConnection {
    async fn execute(
        &mut self,
        statement: &str,
        params: &[JsonValue],
    ) -> Result<RowStream<'_>, AdapterError> {
        let mut q = query(statement);
        for (idx, value) in params.iter().enumerate() {
            q = q.param(&format!("p{}", idx + 1), json_to_bolt(value));
        }

        let mut rows = self
            .graph
            .execute(q)
            .await
            .map_err(|e| classify(&self.backend_id, e))?;

        let backend_id = self.backend_id.clone();
        Ok(Box::pin(try_stream! {
            while let Some(row) = rows.next().await.map_err(|e| classify(&backend_id, e))? {
                yield graph_row(&backend_id, &row)?;
            }
        }))
    }

    fn cancel_handle(&self) -> CancelHandle {
        // Bolt has no out-of-band abort; abandoned sessions are discarded instead.
        CancelHandle::unsupported()
    }

    async fn health_check(&mut self) -> bool {
        self.graph.run(query("RETURN 1")).await.is_ok()
    }

    async fn close(self: Box<Self>) {
        tracing::debug!(backend = %self.backend_id, "Closing graph connection");
    }
}

/// Server-reported errors leave the session usable; everything else ends it.
fn classify(backend_id: &str, e: neo4rs::Error) -> AdapterError {
    match e {
        neo4rs::Error::Neo4j(server) => AdapterError::backend(
            backend_id,
            true,
            format!("{}: {}", server.code(), server.message()),
        ),
        other => AdapterError::io(backend_id, other.to_string()),
    }
}

/// Decodes one record. Columns come back sorted by name; Bolt records carry
/// them in a map, so the statement's column order is not available.
fn graph_row(backend_id: &str, row: &neo4rs::Row) -> Result<Row, AdapterError> {
    let record: BoltMap = row
        .to()
        .map_err(|e| AdapterError::decode(backend_id, format!("record: {}", e)))?;

    let mut columns: Vec<_> = record.value.into_iter().collect();
    columns.sort_by(|a, b| a.0.value.cmp(&b.0.value));

    let mut data = Map::with_capacity(columns.len());
    for (key, bolt) in columns {
        let name = key.value;
        let value = match bolt_to_json(bolt) {
            Some(value) => value,
            None => row.get::<JsonValue>(&name).map_err(|e| {
                AdapterError::decode(backend_id, format!("column '{}': {}", name, e))
            })?,
        };
        data.insert(name, value);
    }
    Ok(Row::new(data))
}

/// Converts a JSON parameter to a Bolt value.
fn json_to_bolt(value: &JsonValue) -> BoltType {
    match value {
        JsonValue::Null => BoltType::Null(BoltNull),
        JsonValue::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or_default())),
        },
        JsonValue::String(s) => BoltType::String(BoltString::new(s)),
        JsonValue::Array(items) => {
            BoltType::List(BoltList::from(items.iter().map(json_to_bolt).collect::<Vec<_>>()))
        }
        JsonValue::Object(fields) => {
            let mut map = BoltMap::new();
            for (key, value) in fields {
                map.put(BoltString::new(key), json_to_bolt(value));
            }
            BoltType::Map(map)
        }
    }
}

fn bolt_map_to_json(map: BoltMap) -> Option<JsonValue> {
    let mut entries: Vec<_> = map.value.into_iter().collect();
    entries.sort_by(|a, b| a.0.value.cmp(&b.0.value));
    let mut out = Map::with_capacity(entries.len());
    for (key, value) in entries {
        out.insert(key.value, bolt_to_json(value)?);
    }
    Some(JsonValue::Object(out))
}

/// Structural conversion for the common Bolt types.
///
/// Returns `None` for temporal and spatial values so the caller can fall back
/// to the driver's own deserialization.
fn bolt_to_json(value: BoltType) -> Option<JsonValue> {
    let json = match value {
        BoltType::Null(_) => JsonValue::Null,
        BoltType::Boolean(b) => JsonValue::Bool(b.value),
        BoltType::Integer(i) => JsonValue::from(i.value),
        BoltType::Float(f) => serde_json::Number::from_f64(f.value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        BoltType::String(s) => JsonValue::String(s.value),
        BoltType::Bytes(b) => {
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(&b.value))
        }
        BoltType::List(list) => JsonValue::Array(
            list.value
                .into_iter()
                .map(bolt_to_json)
                .collect::<Option<Vec<_>>>()?,
        ),
        BoltType::Map(map) => bolt_map_to_json(map)?,
        BoltType::Node(node) => {
            let labels = node
                .labels
                .value
                .into_iter()
                .map(bolt_to_json)
                .collect::<Option<Vec<_>>>()?;
            let mut out = Map::new();
            out.insert("id".into(), JsonValue::from(node.id.value));
            out.insert("labels".into(), JsonValue::Array(labels));
            out.insert("properties".into(), bolt_map_to_json(node.properties)?);
            JsonValue::Object(out)
        }
        BoltType::Relation(rel) => {
            let mut out = Map::new();
            out.insert("id".into(), JsonValue::from(rel.id.value));
            out.insert("type".into(), JsonValue::String(rel.typ.value));
            out.insert("start".into(), JsonValue::from(rel.start_node_id.value));
            out.insert("end".into(), JsonValue::from(rel.end_node_id.value));
            out.insert("properties".into(), bolt_map_to_json(rel.properties)?);
            JsonValue::Object(out)
        }
        _ => return None,
    };
    Some(json)
}
