//! Schema-less rows and their identity.

use serde_json::{Map, Value};

use crate::error::{FeedError, Result};

/// One record as delivered by the provider. Field names map to arbitrary
/// JSON values; no schema is assumed.
pub type Row = Map<String, Value>;

/// Extracts the identity of `row` from `key_column`.
///
/// Strings are used as-is, numbers and booleans by their JSON text. A missing
/// field, `null`, or a composite value yields `None`.
pub fn row_key(row: &Row, key_column: &str) -> Option<String> {
    match row.get(key_column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Decodes a frame body into rows. An object is one row, an array is a list
/// of rows. Non-object array members are skipped.
pub fn parse_rows(body: &str) -> Result<Vec<Row>> {
    let value: Value = serde_json::from_str(body).map_err(|e| FeedError::Parse(e.to_string()))?;
    match value {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => {
            let total = items.len();
            let rows: Vec<Row> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect();
            if rows.len() != total {
                log::debug!("Skipped {} non-object array members", total - rows.len());
            }
            Ok(rows)
        }
        other => Err(FeedError::Parse(format!(
            "expected a JSON object or array, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_and_array_normalize_to_rows() {
        assert_eq!(parse_rows(r#"{"id":1}"#).unwrap().len(), 1);
        let rows = parse_rows(r#"[{"id":1},{"id":2},3]"#).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn scalars_and_garbage_are_parse_errors() {
        assert_eq!(parse_rows("42").unwrap_err().kind(), "parse");
        assert_eq!(parse_rows("Success").unwrap_err().kind(), "parse");
    }

    #[test]
    fn keys_come_from_scalar_fields_only() {
        let row = parse_rows(r#"{"id":7,"sym":"AAPL","nested":{"a":1},"gone":null}"#)
            .unwrap()
            .remove(0);
        assert_eq!(row_key(&row, "id").as_deref(), Some("7"));
        assert_eq!(row_key(&row, "sym").as_deref(), Some("AAPL"));
        assert_eq!(row_key(&row, "nested"), None);
        assert_eq!(row_key(&row, "gone"), None);
        assert_eq!(row_key(&row, "absent"), None);
    }
}
