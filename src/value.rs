//! Datapoint value model shared by the codec, state keeper, update buffer and
//! device models.

use std::collections::BTreeMap;
use std::fmt;

/// A single Tuya datapoint value.
///
/// Tuya's wire JSON only ever carries booleans, integers, floats and strings
/// for `dps` entries, so this mirrors that rather than wrapping a full
/// `serde_json::Value`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Datapoint key -> Value mapping. Ordered so snapshots compare and print
/// deterministically.
pub type Values = BTreeMap<String, Value>;

/// Convert a `dps` JSON object into a `Values` map. Non-object input yields an
/// empty map; callers treat that the same as "no dps".
pub fn values_from_json(v: &serde_json::Value) -> Values {
    let mut out = Values::new();
    if let serde_json::Value::Object(map) = v {
        for (k, v) in map {
            out.insert(k.clone(), Value::from(v));
        }
    }
    out
}

pub fn values_to_json(values: &Values) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = values
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
        .collect();
    serde_json::Value::Object(map)
}

/// Merge `overlay` onto `base`, overlay winning on key conflicts. Neither
/// input is consumed.
pub fn merge(base: &Values, overlay: &Values) -> Values {
    let mut out = base.clone();
    for (k, v) in overlay {
        out.insert(k.clone(), v.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let json = serde_json::json!({"1": true, "2": 55, "3": "auto", "4": 1.5});
        let values = values_from_json(&json);
        assert_eq!(values.get("1"), Some(&Value::Bool(true)));
        assert_eq!(values.get("2"), Some(&Value::Int(55)));
        assert_eq!(values.get("3"), Some(&Value::String("auto".into())));
        assert_eq!(values.get("4"), Some(&Value::Float(1.5)));

        let back = values_to_json(&values);
        assert_eq!(back["1"], serde_json::json!(true));
        assert_eq!(back["2"], serde_json::json!(55));
    }

    #[test]
    fn merge_overlay_wins() {
        let mut base = Values::new();
        base.insert("1".into(), Value::Int(1));
        base.insert("2".into(), Value::Int(2));
        let mut overlay = Values::new();
        overlay.insert("2".into(), Value::Int(3));
        let merged = merge(&base, &overlay);
        assert_eq!(merged.get("1"), Some(&Value::Int(1)));
        assert_eq!(merged.get("2"), Some(&Value::Int(3)));
    }
}
