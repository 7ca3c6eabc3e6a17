//! Foreign values exchanged with language backends.
//!
//! [`Value`] is the single currency crossing every language boundary. Backends
//! hand their native results over as JSON or plain text, and the conversions
//! here are total: anything that cannot be represented degrades to
//! [`Value::Null`] and bumps a process-wide failure counter instead of erroring.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

/// Key marking a JSON object as a typed foreign object rather than a mapping.
pub const TYPE_MARKER: &str = "__type__";

static CONVERSION_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Number of foreign values that degraded to `Null` since process start.
pub fn conversion_failures() -> u64 {
    CONVERSION_FAILURES.load(Ordering::Relaxed)
}

fn record_conversion_failure(what: &str) {
    CONVERSION_FAILURES.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("unsupported foreign value '{}' converted to null", what);
}

/// A structured record produced by a foreign language (class instance, struct).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue {
    /// Foreign type name.
    pub type_name: String,
    /// Field values by name.
    pub fields: BTreeMap<String, Value>,
}

/// Value crossing a language boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Struct(StructValue),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert from JSON.
    ///
    /// Objects carrying a `"__type__"` marker describe foreign objects. A
    /// `"struct"` marker becomes [`Value::Struct`]; any other marker (functions,
    /// modules, handles) is not representable and becomes `Null`.
    pub fn from_json(json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Double).unwrap_or_else(|| {
                    record_conversion_failure("number");
                    Value::Null
                }),
            },
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(mut map) => match map.remove(TYPE_MARKER) {
                None => Value::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                ),
                Some(JsonValue::String(tag)) if tag == "struct" => struct_from_json(map),
                Some(JsonValue::String(tag)) => {
                    record_conversion_failure(&tag);
                    Value::Null
                }
                Some(_) => {
                    record_conversion_failure("malformed type marker");
                    Value::Null
                }
            },
        }
    }

    /// Convert to JSON. Structs are written with a `"__type__": "struct"` marker.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Int(i) => JsonValue::from(*i),
            // NaN and infinities have no JSON form.
            Value::Double(d) => Number::from_f64(*d).map_or(JsonValue::Null, JsonValue::Number),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Struct(record) => {
                let mut object = JsonMap::new();
                object.insert(TYPE_MARKER.to_string(), JsonValue::from("struct"));
                object.insert("name".to_string(), JsonValue::from(record.type_name.clone()));
                object.insert(
                    "fields".to_string(),
                    JsonValue::Object(
                        record
                            .fields
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_json()))
                            .collect(),
                    ),
                );
                JsonValue::Object(object)
            }
        }
    }
}

fn struct_from_json(mut map: JsonMap<String, JsonValue>) -> Value {
    let type_name = match map.remove("name") {
        Some(JsonValue::String(name)) => name,
        _ => {
            record_conversion_failure("struct without name");
            return Value::Null;
        }
    };
    let fields = match map.remove("fields") {
        Some(JsonValue::Object(fields)) => fields
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect(),
        None => BTreeMap::new(),
        Some(_) => {
            record_conversion_failure("struct with non-object fields");
            return Value::Null;
        }
    };
    Value::Struct(StructValue { type_name, fields })
}

/// Convert captured stdout of a backend into a value.
///
/// A single trailing newline is dropped. Integers and finite floats become
/// numbers, JSON objects and arrays are decoded, everything else stays text.
pub fn parse_output(stdout: &str) -> Value {
    let text = stdout
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(stdout);
    let trimmed = text.trim();

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if looks_numeric(trimmed) {
        if let Ok(d) = trimmed.parse::<f64>() {
            if d.is_finite() {
                return Value::Double(d);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<JsonValue>(trimmed) {
            return Value::from_json(json);
        }
    }
    Value::String(text.to_string())
}

/// Rejects words `f64::from_str` accepts ("inf", "NaN") that are really text.
fn looks_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{:?}", d),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Struct(record) => {
                write!(f, "{} {{", record.type_name)?;
                for (i, (k, v)) in record.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", k, v)?;
                }
                write!(f, " }}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_primitives() {
        assert_eq!(Value::from_json(json!(null)), Value::Null);
        assert_eq!(Value::from_json(json!(7)), Value::Int(7));
        assert_eq!(Value::from_json(json!(2.5)), Value::Double(2.5));
        assert_eq!(Value::from_json(json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(json!("hi")), Value::from("hi"));
    }

    #[test]
    fn test_from_json_large_unsigned_becomes_double() {
        let value = Value::from_json(json!(u64::MAX));
        assert!(matches!(value, Value::Double(_)));
    }

    #[test]
    fn test_from_json_nested() {
        let value = Value::from_json(json!({"xs": [1, "two", null], "ok": false}));
        let map = value.as_map().unwrap();
        assert_eq!(map["ok"], Value::Bool(false));
        assert_eq!(
            map["xs"],
            Value::List(vec![Value::Int(1), Value::from("two"), Value::Null])
        );
    }

    #[test]
    fn test_struct_marker() {
        let value = Value::from_json(json!({
            "__type__": "struct",
            "name": "Point",
            "fields": {"x": 1, "y": 2}
        }));
        match &value {
            Value::Struct(record) => {
                assert_eq!(record.type_name, "Point");
                assert_eq!(record.fields["y"], Value::Int(2));
            }
            other => panic!("expected struct, got {:?}", other),
        }
        assert_eq!(Value::from_json(value.to_json()), value);
    }

    #[test]
    fn test_unsupported_marker_degrades_to_null() {
        let before = conversion_failures();
        let value = Value::from_json(json!({"__type__": "function", "name": "f"}));
        assert_eq!(value, Value::Null);
        assert!(conversion_failures() > before);
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("42\n"), Value::Int(42));
        assert_eq!(parse_output("-3.5\n"), Value::Double(-3.5));
        assert_eq!(parse_output("hello world\n"), Value::from("hello world"));
        assert_eq!(parse_output("inf"), Value::from("inf"));
        assert_eq!(parse_output(""), Value::from(""));
        assert_eq!(
            parse_output("[1, 2]\n"),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        // Only one trailing newline is stripped.
        assert_eq!(parse_output("a\n\n"), Value::from("a\n"));
    }

    #[test]
    fn test_display() {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), Value::Int(1));
        let value = Value::List(vec![
            Value::Double(1.0),
            Value::Struct(StructValue {
                type_name: "P".to_string(),
                fields,
            }),
        ]);
        assert_eq!(value.to_string(), "[1.0, P { x: 1 }]");
    }

    #[test]
    fn test_nan_serializes_as_null() {
        assert_eq!(Value::Double(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(serde_json::to_string(&Value::Int(3)).unwrap(), "3");
    }
}
