//! Schema introspection through the router.
//!
//! Introspection statements are ordinary read invocations, so they share the
//! backend's admission limit, pool and deadlines with user queries.

use std::collections::HashSet;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendKind;
use crate::error::{AdapterError, GatewayError};
use crate::router::Router;
use crate::row::{Row, RowError};
use crate::transcoder::ErrorFrame;

const GRAPH_LABELS: &str = "CALL db.labels() YIELD label RETURN label";

const GRAPH_EDGES: &str = "MATCH (a)-[r]->(b) \
    WITH type(r) AS rel_type, keys(r) AS rel_props, labels(a)[0] AS source_label, labels(b)[0] AS target_label \
    RETURN DISTINCT rel_type, rel_props, source_label, target_label";

const POSTGRES_SCHEMA: &str = "SELECT cols.table_name, cols.column_name, cols.data_type, cols.is_nullable, \
    cols.column_default, tc.constraint_type, kcu.constraint_name, \
    ccu.table_name AS foreign_table, ccu.column_name AS foreign_column \
    FROM information_schema.columns cols \
    LEFT JOIN information_schema.key_column_usage kcu \
        ON cols.table_name = kcu.table_name AND cols.column_name = kcu.column_name \
    LEFT JOIN information_schema.table_constraints tc \
        ON tc.constraint_name = kcu.constraint_name AND tc.table_name = cols.table_name \
    LEFT JOIN information_schema.constraint_column_usage ccu \
        ON ccu.constraint_name = tc.constraint_name AND tc.constraint_type = 'FOREIGN KEY' \
    WHERE cols.table_schema = 'public' \
    ORDER BY cols.table_name, cols.ordinal_position";

const MYSQL_SCHEMA: &str = "SELECT cols.TABLE_NAME AS table_name, cols.COLUMN_NAME AS column_name, \
    cols.DATA_TYPE AS data_type, cols.IS_NULLABLE AS is_nullable, cols.COLUMN_DEFAULT AS column_default, \
    tc.CONSTRAINT_TYPE AS constraint_type, kcu.CONSTRAINT_NAME AS constraint_name, \
    kcu.REFERENCED_TABLE_NAME AS foreign_table, kcu.REFERENCED_COLUMN_NAME AS foreign_column \
    FROM information_schema.COLUMNS cols \
    LEFT JOIN information_schema.KEY_COLUMN_USAGE kcu \
        ON kcu.TABLE_SCHEMA = cols.TABLE_SCHEMA AND kcu.TABLE_NAME = cols.TABLE_NAME \
        AND kcu.COLUMN_NAME = cols.COLUMN_NAME \
    LEFT JOIN information_schema.TABLE_CONSTRAINTS tc \
        ON tc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA AND tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
        AND tc.TABLE_NAME = kcu.TABLE_NAME \
    WHERE cols.TABLE_SCHEMA = DATABASE() \
    ORDER BY cols.TABLE_NAME, cols.ORDINAL_POSITION";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Schema {
    Graph(GraphSchema),
    Relational(RelationalSchema),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphSchema {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// One distinct property key set observed on a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub label: String,
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub name: String,
    pub properties: Vec<String>,
    pub source_label: Option<String>,
    pub target_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationalSchema {
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKey {
    pub column_name: String,
    pub referenced_table: Option<String>,
    pub referenced_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constraint {
    pub column_name: String,
    #[serde(rename = "type")]
    pub constraint_type: String,
    pub name: Option<String>,
}

/// Introspects one backend.
pub async fn describe(
    router: &Router,
    backend_id: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Schema, ErrorFrame> {
    let kind = router
        .registry()
        .resolve(backend_id)
        .map_err(|e| ErrorFrame::new(&e, 0))?
        .descriptor
        .kind;

    let introspect = Introspection {
        router,
        backend_id,
        deadline,
        cancel,
    };

    tracing::debug!(backend = %backend_id, %kind, "Describing schema");
    match kind {
        BackendKind::Graph => introspect.graph().await.map(Schema::Graph),
        BackendKind::Postgres => introspect
            .relational(POSTGRES_SCHEMA)
            .await
            .map(Schema::Relational),
        BackendKind::MySql | BackendKind::MariaDb => introspect
            .relational(MYSQL_SCHEMA)
            .await
            .map(Schema::Relational),
    }
}

struct Introspection<'a> {
    router: &'a Router,
    backend_id: &'a str,
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl Introspection<'_> {
    async fn rows(&self, statement: &str) -> Result<Vec<Row>, ErrorFrame> {
        self.router
            .introspect(self.backend_id, statement, self.deadline, self.cancel.clone())
            .outcome()
            .await
            .into_result()
    }

    fn decode_error(&self, e: RowError) -> ErrorFrame {
        let err = GatewayError::Adapter(AdapterError::decode(self.backend_id, e.to_string()));
        ErrorFrame::new(&err, 0)
    }

    async fn graph(&self) -> Result<GraphSchema, ErrorFrame> {
        let labels = self
            .rows(GRAPH_LABELS)
            .await?
            .iter()
            .map(|row| row.get::<String>("label"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.decode_error(e))?;

        let mut nodes = Vec::new();
        for label in labels {
            let statement = format!(
                "MATCH (n:`{}`) RETURN DISTINCT keys(n) AS props",
                label.replace('`', "``")
            );
            for row in self.rows(&statement).await? {
                let properties = row.get("props").map_err(|e| self.decode_error(e))?;
                nodes.push(GraphNode {
                    label: label.clone(),
                    properties,
                });
            }
        }

        let edges = fold_edges(&self.rows(GRAPH_EDGES).await?).map_err(|e| self.decode_error(e))?;
        Ok(GraphSchema { nodes, edges })
    }

    async fn relational(&self, statement: &str) -> Result<RelationalSchema, ErrorFrame> {
        let rows = self.rows(statement).await?;
        fold_tables(&rows).map_err(|e| self.decode_error(e))
    }
}

fn fold_edges(rows: &[Row]) -> Result<Vec<GraphEdge>, RowError> {
    rows.iter()
        .map(|row| {
            Ok(GraphEdge {
                name: row.get("rel_type")?,
                properties: row.get_opt("rel_props")?.unwrap_or_default(),
                source_label: row.get_opt("source_label")?,
                target_label: row.get_opt("target_label")?,
            })
        })
        .collect()
}

/// Folds one row per (column, constraint) into tables.
///
/// Tables keep the order they first appear in, columns keep ordinal order.
fn fold_tables(rows: &[Row]) -> Result<RelationalSchema, RowError> {
    let mut tables: Vec<Table> = Vec::new();
    let mut seen_constraints: HashSet<(String, String, String, Option<String>)> = HashSet::new();

    for row in rows {
        let table_name: String = row.get("table_name")?;
        let column_name: String = row.get("column_name")?;

        let idx = match tables.iter().position(|t| t.name == table_name) {
            Some(idx) => idx,
            None => {
                tables.push(Table {
                    name: table_name.clone(),
                    columns: Vec::new(),
                    foreign_keys: Vec::new(),
                    constraints: Vec::new(),
                });
                tables.len() - 1
            }
        };
        let table = &mut tables[idx];

        if !table.columns.iter().any(|c| c.name == column_name) {
            let nullable: Option<String> = row.get_opt("is_nullable")?;
            table.columns.push(Column {
                name: column_name.clone(),
                data_type: row.get_opt("data_type")?.unwrap_or_default(),
                nullable: nullable.is_some_and(|n| n.eq_ignore_ascii_case("YES")),
                default_value: row.get_opt("column_default")?,
            });
        }

        let Some(constraint_type) = row.get_opt::<String>("constraint_type")? else {
            continue;
        };
        let constraint_name: Option<String> = row.get_opt("constraint_name")?;

        if constraint_type == "FOREIGN KEY" {
            table.foreign_keys.push(ForeignKey {
                column_name,
                referenced_table: row.get_opt("foreign_table")?,
                referenced_column: row.get_opt("foreign_column")?,
            });
        } else if seen_constraints.insert((
            table_name,
            column_name.clone(),
            constraint_type.clone(),
            constraint_name.clone(),
        )) {
            table.constraints.push(Constraint {
                column_name,
                constraint_type,
                name: constraint_name,
            });
        }
    }

    Ok(RelationalSchema { tables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => Row::new(map),
            _ => unreachable!(),
        }
    }

    fn column_row(table: &str, column: &str, constraint: Option<(&str, &str)>) -> Row {
        let (ctype, cname) = constraint.unzip();
        let (foreign_table, foreign_column) = match ctype {
            Some("FOREIGN KEY") => (json!("users"), json!("id")),
            _ => (JsonValue::Null, JsonValue::Null),
        };
        row(json!({
            "table_name": table,
            "column_name": column,
            "data_type": "integer",
            "is_nullable": "NO",
            "column_default": null,
            "constraint_type": ctype,
            "constraint_name": cname,
            "foreign_table": foreign_table,
            "foreign_column": foreign_column,
        }))
    }

    #[test]
    fn test_fold_tables() {
        let rows = vec![
            column_row("orders", "id", Some(("PRIMARY KEY", "orders_pkey"))),
            column_row("orders", "id", Some(("PRIMARY KEY", "orders_pkey"))),
            column_row("orders", "user_id", Some(("FOREIGN KEY", "orders_user_fk"))),
            column_row("orders", "total", None),
            column_row("users", "id", Some(("PRIMARY KEY", "users_pkey"))),
        ];

        let schema = fold_tables(&rows).unwrap();
        assert_eq!(schema.tables.len(), 2);

        let orders = &schema.tables[0];
        assert_eq!(orders.name, "orders");
        let columns: Vec<_> = orders.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["id", "user_id", "total"]);
        assert_eq!(orders.constraints.len(), 1);
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].referenced_table.as_deref(), Some("users"));
        assert!(!orders.columns[0].nullable);
    }

    #[test]
    fn test_fold_edges() {
        let rows = vec![row(json!({
            "rel_type": "KNOWS",
            "rel_props": ["since"],
            "source_label": "Person",
            "target_label": null,
        }))];
        let edges = fold_edges(&rows).unwrap();
        assert_eq!(edges[0].name, "KNOWS");
        assert_eq!(edges[0].properties, vec!["since"]);
        assert_eq!(edges[0].target_label, None);
    }

    #[test]
    fn test_schema_serializes_untagged() {
        let schema = Schema::Graph(GraphSchema::default());
        assert_eq!(
            serde_json::to_value(&schema).unwrap(),
            json!({"nodes": [], "edges": []})
        );
    }
}
