//! Field-type inference over a sample of schema-less rows.
//!
//! Consumers that render or export rows sometimes want a column type. Rows
//! carry none, so this pass looks at the values actually present. A field
//! whose non-null values disagree is reported as `String`. A string that
//! parses as an RFC 3339 timestamp counts as `Date`.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;

use crate::model::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Number,
    Boolean,
    Date,
    String,
    Object,
    Array,
    /// Only nulls were seen.
    Null,
}

fn value_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) => FieldType::Boolean,
        Value::Number(_) => FieldType::Number,
        Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => FieldType::Date,
        Value::String(_) => FieldType::String,
        Value::Array(_) => FieldType::Array,
        Value::Object(_) => FieldType::Object,
    }
}

fn merge(seen: FieldType, next: FieldType) -> FieldType {
    match (seen, next) {
        (a, b) if a == b => a,
        (FieldType::Null, other) | (other, FieldType::Null) => other,
        _ => FieldType::String,
    }
}

/// Infers one type per field name across `rows`.
pub fn infer_field_types(rows: &[Row]) -> BTreeMap<String, FieldType> {
    let mut types = BTreeMap::new();
    for row in rows {
        for (name, value) in row {
            let next = value_type(value);
            types
                .entry(name.clone())
                .and_modify(|seen| *seen = merge(*seen, next))
                .or_insert(next);
        }
    }
    log::trace!("Inferred {} field types from {} rows", types.len(), rows.len());
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn infers_each_kind() {
        let sample = rows(json!([{
            "qty": 10,
            "active": true,
            "ts": "2024-05-01T12:00:00Z",
            "sym": "AAPL",
            "meta": {"a": 1},
            "tags": ["x"],
            "note": null
        }]));
        let types = infer_field_types(&sample);
        assert_eq!(types["qty"], FieldType::Number);
        assert_eq!(types["active"], FieldType::Boolean);
        assert_eq!(types["ts"], FieldType::Date);
        assert_eq!(types["sym"], FieldType::String);
        assert_eq!(types["meta"], FieldType::Object);
        assert_eq!(types["tags"], FieldType::Array);
        assert_eq!(types["note"], FieldType::Null);
    }

    #[test]
    fn nulls_defer_and_conflicts_fall_back_to_string() {
        let sample = rows(json!([
            {"px": null, "mixed": 1},
            {"px": 1.5, "mixed": "one"}
        ]));
        let types = infer_field_types(&sample);
        assert_eq!(types["px"], FieldType::Number);
        assert_eq!(types["mixed"], FieldType::String);
    }
}
