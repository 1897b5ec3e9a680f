use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

const TEMP_ID_PREFIX: &str = "tmp-";

/// Opaque record identifier, keyed by its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Accepts non-empty strings and numbers; anything else is not an id.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => {
                let t = s.trim();
                (!t.is_empty()).then(|| Self(t.to_string()))
            }
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: RecordId,
    pub fields: Map<String, Value>,
    pub dirty: bool,
    pub revision: u64,
}

/// Local edits keyed by record id, in seed order with later additions appended.
#[derive(Debug, Default)]
pub struct EditBuffer {
    entries: HashMap<RecordId, Entry>,
    order: Vec<RecordId>,
}

impl EditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole buffer with one clean entry per record.
    pub fn seed<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = (RecordId, Map<String, Value>)>,
    {
        self.entries.clear();
        self.order.clear();
        for (id, fields) in records {
            if self.entries.contains_key(&id) {
                // Duplicate id in one payload: the later row wins, first position kept.
                if let Some(e) = self.entries.get_mut(&id) {
                    e.fields = fields;
                }
                continue;
            }
            self.order.push(id.clone());
            self.entries.insert(
                id.clone(),
                Entry {
                    id,
                    fields,
                    dirty: false,
                    revision: 0,
                },
            );
        }
    }

    fn entry_mut(&mut self, id: &RecordId) -> &mut Entry {
        if !self.entries.contains_key(id) {
            self.order.push(id.clone());
        }
        self.entries.entry(id.clone()).or_insert_with(|| Entry {
            id: id.clone(),
            fields: Map::new(),
            dirty: false,
            revision: 0,
        })
    }

    pub fn set_field(&mut self, id: &RecordId, field: &str, value: Value) {
        let e = self.entry_mut(id);
        e.fields.insert(field.to_string(), value);
        e.dirty = true;
        e.revision += 1;
    }

    pub fn toggle(&mut self, id: &RecordId, field: &str) -> bool {
        let current = self
            .entries
            .get(id)
            .and_then(|e| e.fields.get(field))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.set_field(id, field, Value::Bool(!current));
        !current
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .cloned()
            .collect()
    }

    pub fn mark_clean(&mut self, id: &RecordId) {
        if let Some(e) = self.entries.get_mut(id) {
            e.dirty = false;
        }
    }

    /// Clean every entry a batch snapshot covered, skipping those edited since.
    /// Returns how many entries were cleaned.
    pub fn mark_all_clean(&mut self, snapshot: &[Entry]) -> usize {
        let mut cleaned = 0;
        for taken in snapshot {
            if self.revision(&taken.id) == Some(taken.revision) {
                self.mark_clean(&taken.id);
                cleaned += 1;
            }
        }
        cleaned
    }

    pub fn get(&self, id: &RecordId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_dirty(&self, id: &RecordId) -> bool {
        self.entries.get(id).map(|e| e.dirty).unwrap_or(false)
    }

    pub fn dirty_ids(&self) -> Vec<RecordId> {
        self.order
            .iter()
            .filter(|id| self.is_dirty(id))
            .cloned()
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    pub fn revision(&self, id: &RecordId) -> Option<u64> {
        self.entries.get(id).map(|e| e.revision)
    }

    /// Add a not-yet-persisted record; it starts dirty.
    pub fn insert_draft(&mut self, id: RecordId, fields: Map<String, Value>) {
        let e = self.entry_mut(&id);
        e.fields = fields;
        e.dirty = true;
        e.revision += 1;
    }

    /// Server-confirmed fields replace local ones; the entry becomes clean.
    pub fn replace_fields(&mut self, id: &RecordId, fields: Map<String, Value>) {
        let e = self.entry_mut(id);
        e.fields = fields;
        e.dirty = false;
        e.revision += 1;
    }

    /// Move an entry to a new id, keeping its position.
    pub fn rekey(&mut self, from: &RecordId, to: &RecordId) {
        let Some(mut e) = self.entries.remove(from) else {
            return;
        };
        if self.entries.contains_key(to) {
            self.order.retain(|id| id != to);
        }
        e.id = to.clone();
        self.entries.insert(to.clone(), e);
        for id in self.order.iter_mut() {
            if id == from {
                *id = to.clone();
            }
        }
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Entry> {
        self.order.retain(|x| x != id);
        self.entries.remove(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
