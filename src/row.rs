//! Row and streaming types for query results.

use crate::error::AdapterError;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::pin::Pin;
use thiserror::Error;

/// Positional statement parameters.
///
/// Bound as `$1..$N` on PostgreSQL, `?` on MySQL/MariaDB and `$p1..$pN` on
/// the graph backend.
pub type Params = Vec<JsonValue>;

/// A stream of rows produced by an adapter.
///
/// Rows are fetched on demand from the driver. The stream borrows the
/// connection it was produced on.
pub type RowStream<'a> = Pin<Box<dyn Stream<Item = Result<Row, AdapterError>> + Send + 'a>>;

/// Typed extraction failure.
#[derive(Error, Debug)]
pub enum RowError {
    #[error("column not found: {0}")]
    Missing(String),

    #[error("failed to deserialize '{column}': {message}")]
    Decode { column: String, message: String },
}

/// A single result row.
///
/// Columns keep the order the backend returned them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row {
    data: Map<String, JsonValue>,
}

impl Row {
    /// Creates a new row from an ordered map of column names to values.
    pub fn new(data: Map<String, JsonValue>) -> Self {
        Self { data }
    }

    /// Gets a value from the row by column name, deserializing to the requested type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let table: String = row.get("table_name")?;
    /// ```
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, RowError> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| RowError::Missing(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| RowError::Decode {
            column: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Gets a value from the row, returning `None` if the key doesn't exist or is null.
    ///
    /// Still returns an error if the key exists but deserialization fails.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RowError> {
        match self.data.get(key) {
            Some(v) if v.is_null() => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| RowError::Decode {
                    column: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Returns the raw JSON value for a column, if it exists.
    pub fn get_raw(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Returns all column names in backend order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the row and returns the underlying data map.
    pub fn into_inner(self) -> Map<String, JsonValue> {
        self.data
    }
}

impl From<Map<String, JsonValue>> for Row {
    fn from(data: Map<String, JsonValue>) -> Self {
        Self::new(data)
    }
}

impl FromIterator<(String, JsonValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, JsonValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_row_get_string() {
        let row = row(&[("name", json!("test"))]);
        let name: String = row.get("name").unwrap();
        assert_eq!(name, "test");
    }

    #[test]
    fn test_row_get_number() {
        let row = row(&[("count", json!(42))]);
        let count: i64 = row.get("count").unwrap();
        assert_eq!(count, 42);
    }

    #[test]
    fn test_row_get_missing_key() {
        let row = Row::default();
        let result: Result<String, _> = row.get("missing");
        assert!(matches!(result, Err(RowError::Missing(_))));
    }

    #[test]
    fn test_row_get_wrong_type() {
        let row = row(&[("count", json!("many"))]);
        let result: Result<i64, _> = row.get("count");
        assert!(matches!(result, Err(RowError::Decode { .. })));
    }

    #[test]
    fn test_row_get_opt_null() {
        let row = row(&[("name", JsonValue::Null)]);
        let name: Option<String> = row.get_opt("name").unwrap();
        assert_eq!(name, None);
        let missing: Option<String> = row.get_opt("other").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_row_columns_keep_backend_order() {
        let row = row(&[("z", json!(1)), ("a", json!(2)), ("m", json!(3))]);
        let columns: Vec<_> = row.columns().collect();
        assert_eq!(columns, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_row_serializes_as_object() {
        let row = row(&[("id", json!(7)), ("name", json!("x"))]);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"id":7,"name":"x"}"#
        );
    }
}
