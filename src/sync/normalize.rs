use serde_json::{Map, Value};
use std::collections::HashMap;

use super::buffer::RecordId;

/// Which response envelope a collection payload arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Bare,
    Paginated,
    DomainField,
    Unrecognized,
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Bare => "bare",
            Shape::Paginated => "paginated",
            Shape::DomainField => "domain_field",
            Shape::Unrecognized => "unrecognized",
        }
    }
}

/// A server-owned record: its canonical id plus the raw object as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub data: Map<String, Value>,
}

impl Record {
    pub fn from_value(value: &Value) -> Option<Self> {
        let data = value.as_object()?;
        let id = data.get("id").and_then(RecordId::from_value)?;
        Some(Self {
            id,
            data: data.clone(),
        })
    }

    /// The id exactly as the server sent it (number or string).
    pub fn raw_id(&self) -> Value {
        self.data
            .get("id")
            .cloned()
            .unwrap_or_else(|| Value::String(self.id.as_str().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub records: Vec<Record>,
    pub shape: Shape,
    pub skipped: usize,
}

/// Resolve the envelope in a fixed order: bare array, `results`, then `domain_field`.
pub fn extract_sequence<'a>(payload: &'a Value, domain_field: &str) -> (Shape, &'a [Value]) {
    if let Some(items) = payload.as_array() {
        return (Shape::Bare, items.as_slice());
    }
    if let Some(items) = payload.get("results").and_then(|v| v.as_array()) {
        return (Shape::Paginated, items.as_slice());
    }
    if let Some(items) = payload.get(domain_field).and_then(|v| v.as_array()) {
        return (Shape::DomainField, items.as_slice());
    }
    (Shape::Unrecognized, &[])
}

pub fn normalize(payload: &Value, domain_field: &str) -> Normalized {
    let (shape, items) = extract_sequence(payload, domain_field);
    if shape == Shape::Unrecognized {
        tracing::warn!(
            domain_field,
            kind = json_kind(payload),
            "unrecognized collection payload; treating as empty"
        );
    }

    let mut records = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for (i, item) in items.iter().enumerate() {
        match Record::from_value(item) {
            Some(r) => records.push(r),
            None => {
                skipped += 1;
                tracing::debug!(index = i, domain_field, "skipping collection item without id");
            }
        }
    }

    Normalized {
        records,
        shape,
        skipped,
    }
}

/// Fold `[{key_field, value_field}]` pairs into a mapping; later duplicates win.
pub fn fold_by_key(
    payload: &Value,
    domain_field: &str,
    key_field: &str,
    value_field: &str,
) -> HashMap<RecordId, Value> {
    let (_, items) = extract_sequence(payload, domain_field);
    let mut out = HashMap::new();
    for item in items {
        let Some(key) = item.get(key_field).and_then(RecordId::from_value) else {
            continue;
        };
        out.insert(key, item.get(value_field).cloned().unwrap_or(Value::Null));
    }
    out
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
