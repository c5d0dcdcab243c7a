//! Core types for the N1QL client library

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// A decoded JSON value from a query response
///
/// The query service returns untyped JSON. Numbers keep their wire text so
/// integral values serialize back without a fractional part, and objects keep
/// their keys sorted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Try to convert value to a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to convert value to a f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Try to convert value to an i64; only integral numbers qualify
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Try to convert value to a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Compact JSON text of this value
    pub fn to_json_string(&self) -> String {
        serde_json::Value::from(self.clone()).to_string()
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => items.serialize(serializer),
            Value::Object(fields) => fields.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// A positional argument passed with a statement
///
/// Encoded on the wire as text: strings are wrapped in double quotes, bytes
/// are sent as-is (they must already be valid JSON), everything else uses its
/// display form.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Arg {
    /// Wire text for this argument
    pub fn to_wire(&self) -> String {
        match self {
            Arg::Null => "null".to_string(),
            Arg::Bool(b) => b.to_string(),
            Arg::Int(i) => i.to_string(),
            Arg::UInt(u) => u.to_string(),
            Arg::Float(f) => f.to_string(),
            Arg::Str(s) => format!("\"{}\"", s),
            Arg::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Arg::Json(j) => j.to_string(),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(b)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Arg::Int(i64::from(i))
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

impl From<u32> for Arg {
    fn from(u: u32) -> Self {
        Arg::UInt(u64::from(u))
    }
}

impl From<u64> for Arg {
    fn from(u: u64) -> Self {
        Arg::UInt(u)
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Float(f)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(j: serde_json::Value) -> Self {
        Arg::Json(j)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Arg::Null)
    }
}

/// Conversion from a column value into a typed destination
///
/// There is no implicit widening: a `f64` needs a number, a `bool` needs a
/// boolean. A `String` takes string values directly and any other value as
/// its compact JSON text.
pub trait FromValue: Sized {
    fn from_value(value: &Value, index: usize) -> Result<Self>;
}

fn mismatch(index: usize, target: &'static str, value: &Value) -> Error {
    Error::ScanTypeMismatch {
        index,
        target,
        value: format!("{} ({})", value, value.kind()),
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value, index: usize) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch(index, "f64", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value, index: usize) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch(index, "i64", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value, index: usize) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch(index, "bool", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value, _index: usize) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_json_string()),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value, _index: usize) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value, index: usize) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other, index).map(Some),
        }
    }
}

/// Conversion from a whole row of column values, in column order
pub trait FromRow: Sized {
    fn from_row(values: &[Value]) -> Result<Self>;
}

fn check_width(requested: usize, values: &[Value]) -> Result<()> {
    if requested > values.len() {
        return Err(Error::ScanInsufficientColumns {
            requested,
            available: values.len(),
        });
    }
    Ok(())
}

macro_rules! tuple_from_row {
    ($count:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(values: &[Value]) -> Result<Self> {
                check_width($count, values)?;
                Ok(($($name::from_value(&values[$idx], $idx)?,)+))
            }
        }
    };
}

tuple_from_row!(1; A: 0);
tuple_from_row!(2; A: 0, B: 1);
tuple_from_row!(3; A: 0, B: 1, C: 2);
tuple_from_row!(4; A: 0, B: 1, C: 2, D: 3);
tuple_from_row!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_from_row!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_from_row!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_from_row!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

impl FromRow for Vec<Value> {
    fn from_row(values: &[Value]) -> Result<Self> {
        Ok(values.to_vec())
    }
}

/// A row returned from a query
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Get value by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get value by index
    pub fn get_idx(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get all column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Convert the values into typed destinations, in column order
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        T::from_row(&self.values)
    }

    /// Convert row to a HashMap
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Deserialize row into a typed struct
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let json = serde_json::to_value(self.to_map())?;
        Ok(serde_json::from_value(json)?)
    }
}

/// Outcome of a statement run through `exec`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    rows_affected: u64,
}

impl ExecResult {
    pub(crate) fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }

    /// `metrics.mutationCount` as reported by the service
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_value_conversions() {
        let v = parse("42");
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));
        assert!(!v.is_null());

        let v = Value::Null;
        assert!(v.is_null());
        assert_eq!(v.as_i64(), None);
    }

    #[test]
    fn test_composite_json_text() {
        assert_eq!(parse("[1,2,3]").to_json_string(), "[1,2,3]");
        assert_eq!(
            parse(r#"{"c":"d","a":"b"}"#).to_json_string(),
            r#"{"a":"b","c":"d"}"#
        );
    }

    #[test]
    fn test_arg_wire_text() {
        assert_eq!(Arg::from("Baltika").to_wire(), "\"Baltika\"");
        assert_eq!(Arg::from(br#"{"a":1}"#.as_slice()).to_wire(), r#"{"a":1}"#);
        assert_eq!(Arg::from(975).to_wire(), "975");
        assert_eq!(Arg::from(4.8).to_wire(), "4.8");
        assert_eq!(Arg::from(false).to_wire(), "false");
        assert_eq!(Arg::from(None::<i64>).to_wire(), "null");
    }

    #[test]
    fn test_scan_simple_fields() {
        let row = Row::new(
            vec!["abv".into(), "is_twenty".into(), "name".into()],
            vec![parse("7.0"), Value::Bool(true), Value::from("Baltika 6")],
        );
        let (abv, is_twenty, name): (f64, bool, String) = row.scan().unwrap();
        assert_eq!(abv, 7.0);
        assert!(is_twenty);
        assert_eq!(name, "Baltika 6");
    }

    #[test]
    fn test_scan_composites_into_strings() {
        let row = Row::new(
            vec!["arr".into(), "obj".into()],
            vec![parse("[1,2,3]"), parse(r#"{"a":"b","c":"d"}"#)],
        );
        let (arr, obj): (String, String) = row.scan().unwrap();
        assert_eq!(arr, "[1,2,3]");
        assert_eq!(obj, "{\"a\":\"b\",\"c\":\"d\"}");
    }

    #[test]
    fn test_scan_no_widening() {
        let row = Row::new(vec!["abv".into()], vec![Value::from("7.0")]);
        let err = row.scan::<(f64,)>().unwrap_err();
        assert!(matches!(err, Error::ScanTypeMismatch { index: 0, target: "f64", .. }));

        let row = Row::new(vec!["flag".into()], vec![parse("1")]);
        assert!(matches!(
            row.scan::<(bool,)>(),
            Err(Error::ScanTypeMismatch { target: "bool", .. })
        ));
    }

    #[test]
    fn test_scan_insufficient_columns() {
        let row = Row::new(vec!["a".into()], vec![parse("1")]);
        let err = row.scan::<(f64, f64)>().unwrap_err();
        assert!(matches!(
            err,
            Error::ScanInsufficientColumns { requested: 2, available: 1 }
        ));
    }

    #[test]
    fn test_row_access() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![parse("1"), Value::from("Alice")],
        );

        assert_eq!(row.get("id").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(row.get("name").and_then(|v| v.as_str()), Some("Alice"));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Beer {
            name: String,
            abv: f64,
        }

        let row = Row::new(
            vec!["abv".into(), "name".into()],
            vec![parse("4.8"), Value::from("Estrella Levante Clasica")],
        );
        let beer: Beer = row.deserialize().unwrap();
        assert_eq!(
            beer,
            Beer {
                name: "Estrella Levante Clasica".into(),
                abv: 4.8
            }
        );
    }
}
