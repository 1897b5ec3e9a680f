use std::sync::Arc;

use serde_json::{Map, Value};

use super::error::err;
use super::types::{AppState, Request};
use crate::sync::buffer::RecordId;
use crate::sync::normalize::Record;
use crate::transport::Transport;

pub fn session_transport(state: &AppState, req: &Request) -> Result<Arc<dyn Transport>, Value> {
    state
        .session
        .as_ref()
        .map(|s| Arc::clone(&s.transport))
        .ok_or_else(|| err(&req.id, "no_session", "connect a session first", None))
}

/// Row ids arrive as JSON numbers or strings.
pub fn required_id(req: &Request, key: &str) -> Result<RecordId, Value> {
    req.params
        .get(key)
        .and_then(RecordId::from_value)
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_id(req: &Request, key: &str) -> Option<RecordId> {
    req.params.get(key).and_then(RecordId::from_value)
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn parse_opt_string(v: Option<&Value>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => Ok(Some(v.as_str().ok_or("must be string or null")?.to_string())),
    }
}

pub fn parse_opt_bool(v: Option<&Value>) -> Result<Option<bool>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or("must be boolean"),
    }
}

/// Copy the named fields out of a server record; missing ones become `default`.
pub fn pick_fields(record: &Record, fields: &[&str], default: &Value) -> Map<String, Value> {
    fields
        .iter()
        .map(|f| {
            let v = record
                .data
                .get(*f)
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| default.clone());
            (f.to_string(), v)
        })
        .collect()
}
