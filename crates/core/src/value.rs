use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A resolved column value.
///
/// Mirrors the shapes a data source can hand back: scalars, timestamps,
/// lists and nested records. `Null` is an explicit "no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extract as string, returning None for non-text values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Follow one key into a nested map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Convert into plain JSON for display or line-oriented output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(m) => Value::Map(
                m.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect(),
            ),
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

impl From<i32> for Value {
    fn from(v: i32) -> Self {
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
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// An unstructured item yielded by a table resolver, before column resolution.
///
/// Items are read by field name, so resolvers can hand back either a typed
/// record built in Rust or whatever JSON the upstream API returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    Record(IndexMap<String, Value>),
    Json(serde_json::Value),
}

impl RawItem {
    /// Look up a field by name. Dots descend into nested records
    /// (`"Owner.Id"`). Returns `None` when any segment is missing.
    pub fn field(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        match self {
            RawItem::Record(fields) => {
                let mut current = fields.get(first)?;
                for seg in segments {
                    current = current.get(seg)?;
                }
                Some(current.clone())
            }
            RawItem::Json(json) => {
                let mut current = json.as_object()?.get(first)?;
                for seg in segments {
                    current = current.as_object()?.get(seg)?;
                }
                Some(Value::from(current))
            }
        }
    }
}

impl From<serde_json::Value> for RawItem {
    fn from(v: serde_json::Value) -> Self {
        RawItem::Json(v)
    }
}

impl From<IndexMap<String, Value>> for RawItem {
    fn from(v: IndexMap<String, Value>) -> Self {
        RawItem::Record(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_field_lookup_descends_into_objects() {
        let item = RawItem::from(serde_json::json!({
            "Id": 7,
            "Owner": { "Name": "ops", "Zero": 0 },
        }));
        assert_eq!(item.field("Id"), Some(Value::Int(7)));
        assert_eq!(item.field("Owner.Name"), Some(Value::from("ops")));
        assert_eq!(item.field("Owner.Zero"), Some(Value::Int(0)));
        assert_eq!(item.field("Owner.Missing"), None);
        assert_eq!(item.field("Id.Nested"), None);
    }

    #[test]
    fn record_field_lookup() {
        let mut inner = IndexMap::new();
        inner.insert("Region".to_string(), Value::from("eu-west-1"));
        let mut fields = IndexMap::new();
        fields.insert("Name".to_string(), Value::from("bucket"));
        fields.insert("Location".to_string(), Value::Map(inner));
        let item = RawItem::from(fields);

        assert_eq!(item.field("Name"), Some(Value::from("bucket")));
        assert_eq!(item.field("Location.Region"), Some(Value::from("eu-west-1")));
        assert_eq!(item.field("Other"), None);
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        assert_eq!(Value::from(&serde_json::json!(42)), Value::Int(42));
        assert_eq!(Value::from(&serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(&serde_json::json!(null)), Value::Null);
    }

    #[test]
    fn to_json_renders_timestamps_as_rfc3339() {
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            Value::from(ts).to_json(),
            serde_json::json!("2024-01-02T03:04:05+00:00")
        );
    }
}
