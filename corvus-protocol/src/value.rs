//! Typed wire values and documents.
//!
//! A [`Value`] is the closed set of shapes the record format can carry;
//! dispatch over it is exhaustive matching, so adding a wire shape is a
//! compile-time-checked change. A [`Document`] is an ordered mapping of
//! field name to value plus explicit record metadata (class, record id,
//! version) — the reserved `@`-prefixed fields of the wire format,
//! which are never serialized as field content.

use crate::rid::RecordId;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A record shared by reference after graph resolution.
///
/// Resolution replaces link fields with clones of one `Arc` per record,
/// so a record referenced from several places is the same instance
/// everywhere. Cyclic graphs keep their `Arc`s alive until the caller
/// drops the graph as a whole.
pub type SharedRecord = Arc<RwLock<Document>>;

/// A single wire value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Point in time; serialized as epoch milliseconds with a `t` suffix.
    DateTime(DateTime<Utc>),
    /// An unresolved reference to another record.
    Link(RecordId),
    List(Vec<Value>),
    /// A nested document, serialized parenthesized.
    Embedded(Document),
    /// A plain nested mapping, serialized braced with quoted keys.
    Map(Vec<(String, Value)>),
    /// A live reference produced by graph resolution. Compared by
    /// pointer identity, printed by record id.
    Record(SharedRecord),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&Document> {
        match self {
            Value::Embedded(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&SharedRecord> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Converts a JSON value into a wire value.
    ///
    /// Strings in canonical `#cluster:position` form become links;
    /// objects carrying `@class` or `@type` become embedded documents,
    /// other objects become plain maps. Field order inside objects
    /// follows `serde_json`'s map ordering.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => match s.parse::<RecordId>() {
                Ok(rid) => Value::Link(rid),
                Err(_) => Value::String(s.clone()),
            },
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.contains_key("@class") || map.contains_key("@type") {
                    match Document::from_json(json) {
                        Some(doc) => Value::Embedded(doc),
                        None => Value::Null,
                    }
                } else {
                    Value::Map(
                        map.iter()
                            .map(|(k, v)| (k.clone(), Value::from_json(v)))
                            .collect(),
                    )
                }
            }
        }
    }

    /// Converts a wire value into JSON.
    ///
    /// Links and resolved records render as their canonical record id
    /// string; datetimes render as epoch milliseconds.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(x) => serde_json::Number::from_f64(*x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::from(dt.timestamp_millis()),
            Value::Link(rid) => serde_json::Value::String(rid.to_string()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Embedded(doc) => doc.to_json(),
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Record(record) => match record.read().rid() {
                Some(rid) => serde_json::Value::String(rid.to_string()),
                None => serde_json::Value::Null,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Value::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Value::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Value::String(v) => f.debug_tuple("String").field(v).finish(),
            Value::DateTime(v) => f.debug_tuple("DateTime").field(v).finish(),
            Value::Link(rid) => write!(f, "Link({rid})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Embedded(doc) => f.debug_tuple("Embedded").field(doc).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            // Never descend into the target: resolved graphs may be cyclic.
            Value::Record(record) => match record.try_read().and_then(|doc| doc.rid()) {
                Some(rid) => write!(f, "Record({rid})"),
                None => write!(f, "Record(#?)"),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Link(a), Value::Link(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Embedded(a), Value::Embedded(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Resolved records are identity, not structure.
            (Value::Record(a), Value::Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
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
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<RecordId> for Value {
    fn from(v: RecordId) -> Self {
        Value::Link(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

/// An ordered mapping of field name to typed value, plus record
/// metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    class: Option<String>,
    rid: Option<RecordId>,
    version: Option<i32>,
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn set_class(&mut self, class: impl Into<String>) {
        self.class = Some(class.into());
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: RecordId) {
        self.rid = Some(rid);
    }

    pub fn version(&self) -> Option<i32> {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = Some(version);
    }

    /// Sets a field, replacing an existing field of the same name in
    /// place (insertion order of the remaining fields is preserved).
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find_map(|(k, v)| (k == name).then_some(v))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find_map(|(k, v)| (k == name).then_some(v))
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Iterates fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.fields.iter_mut().map(|(k, v)| (k.as_str(), &mut *v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Wraps this document for identity-preserving sharing.
    pub fn into_shared(self) -> SharedRecord {
        Arc::new(RwLock::new(self))
    }

    /// Builds a document from a JSON object.
    ///
    /// `@class`, `@rid` and `@version` keys populate the metadata;
    /// `@type` and `@options` are accepted and dropped. Returns `None`
    /// for non-object JSON.
    pub fn from_json(json: &serde_json::Value) -> Option<Document> {
        let map = json.as_object()?;
        let mut doc = Document::new();

        for (key, value) in map {
            match key.as_str() {
                "@class" => {
                    if let Some(class) = value.as_str() {
                        doc.class = Some(class.to_string());
                    }
                }
                "@rid" => {
                    if let Some(rid) = value.as_str().and_then(|s| s.parse().ok()) {
                        doc.rid = Some(rid);
                    }
                }
                "@version" => {
                    if let Some(version) = value.as_i64() {
                        doc.version = Some(version as i32);
                    }
                }
                "@type" | "@options" => {}
                _ => doc.fields.push((key.clone(), Value::from_json(value))),
            }
        }

        Some(doc)
    }

    /// Renders this document as JSON, metadata included as `@` keys.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(class) = &self.class {
            map.insert("@class".to_string(), serde_json::Value::from(class.clone()));
        }
        if let Some(rid) = self.rid {
            map.insert("@rid".to_string(), serde_json::Value::from(rid.to_string()));
        }
        if let Some(version) = self.version {
            map.insert("@version".to_string(), serde_json::Value::from(version));
        }
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Epoch-milliseconds helper for building [`Value::DateTime`] fields.
    pub fn datetime_from_millis(millis: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(millis).single()
    }
}
