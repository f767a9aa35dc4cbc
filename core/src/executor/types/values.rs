//! Runtime value types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Obj(BTreeMap<String, Val>),
    /// Result slot of a parallel branch that failed, timed out or was cancelled
    Unavailable,
}

impl Val {
    /// Check if value is truthy (for conditionals)
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Bool(b) => *b,
            Val::Null | Val::Unavailable => false,
            _ => true,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Val::Unavailable)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Obj(_) => "object",
            Val::Unavailable => "unavailable",
        }
    }

    /// Plain JSON rendering, `Unavailable` becomes `null`
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Val::Null | Val::Unavailable => serde_json::Value::Null,
            Val::Bool(b) => serde_json::Value::Bool(*b),
            Val::Num(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Val::Str(s) => serde_json::Value::String(s.clone()),
            Val::List(items) => serde_json::Value::Array(items.iter().map(Val::to_json).collect()),
            Val::Obj(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Val {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(b),
            serde_json::Value::Number(n) => Val::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Val::Str(s),
            serde_json::Value::Array(items) => Val::List(items.into_iter().map(Val::from).collect()),
            serde_json::Value::Object(map) => {
                Val::Obj(map.into_iter().map(|(k, v)| (k, Val::from(v))).collect())
            }
        }
    }
}

impl From<toml::Value> for Val {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Val::Str(s),
            toml::Value::Integer(i) => Val::Num(i as f64),
            toml::Value::Float(f) => Val::Num(f),
            toml::Value::Boolean(b) => Val::Bool(b),
            toml::Value::Datetime(d) => Val::Str(d.to_string()),
            toml::Value::Array(items) => Val::List(items.into_iter().map(Val::from).collect()),
            toml::Value::Table(map) => {
                Val::Obj(map.into_iter().map(|(k, v)| (k, Val::from(v))).collect())
            }
        }
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => write!(f, "NULL"),
            Val::Bool(true) => write!(f, "TRUE"),
            Val::Bool(false) => write!(f, "FALSE"),
            Val::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Val::Num(n) => write!(f, "{}", n),
            Val::Str(s) => write!(f, "{}", s),
            Val::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Val::Obj(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Val::Unavailable => write!(f, "<unavailable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(Val::Bool(true).is_truthy());
        assert!(!Val::Null.is_truthy());
        assert!(!Val::Unavailable.is_truthy());
        assert!(Val::Num(0.0).is_truthy());
    }

    #[test]
    fn test_from_plain_json() {
        let val = Val::from(json!({"age": 70, "tags": ["a"], "ok": true}));
        match val {
            Val::Obj(map) => {
                assert_eq!(map["age"], Val::Num(70.0));
                assert_eq!(map["tags"], Val::List(vec![Val::Str("a".into())]));
                assert_eq!(map["ok"], Val::Bool(true));
            }
            other => panic!("Expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_renders_as_null_json() {
        assert_eq!(
            Val::List(vec![Val::Num(1.0), Val::Unavailable]).to_json(),
            json!([1.0, null])
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Val::Num(3.0).to_string(), "3");
        assert_eq!(Val::Num(2.5).to_string(), "2.5");
        assert_eq!(
            Val::List(vec![Val::Str("a".into()), Val::Bool(false)]).to_string(),
            "[a, FALSE]"
        );
    }
}
