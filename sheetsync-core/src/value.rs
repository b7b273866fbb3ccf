//! Cell values and rows.
//!
//! Spreadsheet cells arrive untyped: the same logical value can show up as
//! `1`, `"1"` or `" 1 "` depending on who last touched the cell. `CellValue`
//! models a cell as a tagged variant and defines the loose equality the
//! change detector uses, so type-laundering through the sheet doesn't turn
//! into spurious diffs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single cell value from either side of the sync.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

/// A row keyed by target-table column name.
///
/// BTreeMap so that serialized snapshots have sorted keys and compare
/// byte-for-byte across cycles.
pub type Row = BTreeMap<String, CellValue>;

impl CellValue {
    /// Convert a JSON value (change-log snapshot, spreadsheet API response)
    /// into a cell value. Strings stay strings; loose equality takes care of
    /// timestamp-shaped text.
    pub fn from_json(value: Value) -> CellValue {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int(i)
                } else {
                    CellValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => CellValue::Text(s),
            other => CellValue::Json(other),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int(i) => Value::from(*i),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            CellValue::Json(v) => v.clone(),
        }
    }

    /// The string form written into spreadsheet cells.
    ///
    /// Whole floats print without a fractional part (`1`, not `1.0`) so a
    /// round trip through the sheet compares equal again.
    pub fn display_string(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            CellValue::Text(s) => s.clone(),
            CellValue::Timestamp(ts) => ts.to_rfc3339(),
            CellValue::Json(v) => v.to_string(),
        }
    }

    /// True for NULL cells and whitespace-only text.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Loose equality across the sheet/table type boundary.
    ///
    /// Nulls are equal to each other, timestamps compare by instant (also
    /// against timestamp-shaped text), JSON compares structurally, and
    /// everything else compares by trimmed string form.
    pub fn loosely_eq(&self, other: &CellValue) -> bool {
        match (self, other) {
            (CellValue::Null, CellValue::Null) => true,
            (CellValue::Null, v) | (v, CellValue::Null) => v.is_empty(),
            (CellValue::Json(a), CellValue::Json(b)) => a == b,
            (CellValue::Timestamp(a), CellValue::Timestamp(b)) => a == b,
            (CellValue::Timestamp(ts), other) | (other, CellValue::Timestamp(ts)) => {
                match parse_timestamp(&other.display_string()) {
                    Some(parsed) => parsed == *ts,
                    None => ts.to_rfc3339() == other.display_string().trim(),
                }
            }
            (a, b) => a.display_string().trim() == b.display_string().trim(),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(CellValue::from_json(Value::deserialize(deserializer)?))
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a JSON object into a row. Non-object values yield None.
pub fn row_from_json(value: Value) -> Option<Row> {
    match value {
        Value::Object(map) => Some(
            map.into_iter()
                .map(|(k, v)| (k, CellValue::from_json(v)))
                .collect(),
        ),
        _ => None,
    }
}

pub fn row_to_json(row: &Row) -> Value {
    Value::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn int_equals_numeric_string() {
        assert!(CellValue::Int(1).loosely_eq(&CellValue::Text("1".into())));
        assert!(CellValue::Int(1).loosely_eq(&CellValue::Text(" 1 ".into())));
        assert!(!CellValue::Int(1).loosely_eq(&CellValue::Text("2".into())));
    }

    #[test]
    fn whole_float_equals_int() {
        assert!(CellValue::Float(1.0).loosely_eq(&CellValue::Int(1)));
        assert!(CellValue::Float(1.5).loosely_eq(&CellValue::Text("1.5".into())));
        assert!(!CellValue::Float(1.5).loosely_eq(&CellValue::Int(1)));
    }

    #[test]
    fn null_equals_empty_text() {
        assert!(CellValue::Null.loosely_eq(&CellValue::Null));
        assert!(CellValue::Null.loosely_eq(&CellValue::Text("  ".into())));
        assert!(!CellValue::Null.loosely_eq(&CellValue::Int(0)));
    }

    #[test]
    fn timestamps_compare_by_instant() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let same_instant = CellValue::Text("2026-03-01T13:00:00+01:00".into());
        assert!(CellValue::Timestamp(ts).loosely_eq(&same_instant));
        let other = CellValue::Text("2026-03-01T12:00:01Z".into());
        assert!(!CellValue::Timestamp(ts).loosely_eq(&other));
    }

    #[test]
    fn json_round_trip() {
        let v = CellValue::from_json(serde_json::json!({"a": 1}));
        assert!(matches!(v, CellValue::Json(_)));
        assert_eq!(v.to_json(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn display_strings() {
        assert_eq!(CellValue::Null.display_string(), "");
        assert_eq!(CellValue::Float(3.0).display_string(), "3");
        assert_eq!(CellValue::Bool(true).display_string(), "true");
    }

    #[test]
    fn row_snapshot_round_trip() {
        let mut row = Row::new();
        row.insert("id".into(), CellValue::Int(1));
        row.insert("name".into(), CellValue::Text("Alice".into()));
        let json = row_to_json(&row);
        let back = row_from_json(json).expect("object");
        assert_eq!(back, row);
    }
}
