use serde_json::{Map, Value};
use thiserror::Error;

use super::buffer::{Entry, RecordId};
use super::normalize::Record;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server response for {0} carried no usable id")]
    MissingIdentifier(RecordId),
}

impl PersistError {
    pub fn details(&self) -> Value {
        match self {
            PersistError::Transport(e) => e.details(),
            PersistError::MissingIdentifier(id) => serde_json::json!({ "id": id }),
        }
    }
}

/// One row-level request, prepared while the page state is locked.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitPlan {
    Create { temp_id: RecordId, path: String, body: Value },
    Update { id: RecordId, path: String, body: Value },
    /// Detail action endpoint that answers with the updated record.
    Action { id: RecordId, path: String, body: Value },
    Delete { id: RecordId, path: String },
}

impl CommitPlan {
    pub fn id(&self) -> &RecordId {
        match self {
            CommitPlan::Create { temp_id, .. } => temp_id,
            CommitPlan::Update { id, .. }
            | CommitPlan::Action { id, .. }
            | CommitPlan::Delete { id, .. } => id,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            CommitPlan::Create { .. } => "create",
            CommitPlan::Update { .. } => "update",
            CommitPlan::Action { .. } => "action",
            CommitPlan::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommittedRow {
    Saved { previous_id: RecordId, record: Record },
    Deleted(RecordId),
}

pub async fn commit_row(
    transport: &dyn Transport,
    plan: &CommitPlan,
) -> Result<CommittedRow, PersistError> {
    match plan {
        CommitPlan::Create { temp_id, path, body } => {
            let resp = transport.post(path, body).await?;
            let record = Record::from_value(&resp)
                .ok_or_else(|| PersistError::MissingIdentifier(temp_id.clone()))?;
            tracing::info!(temp_id = %temp_id, id = %record.id, "row created");
            Ok(CommittedRow::Saved {
                previous_id: temp_id.clone(),
                record,
            })
        }
        CommitPlan::Update { id, path, body } => {
            let resp = transport.put(path, body).await?;
            Ok(CommittedRow::Saved {
                previous_id: id.clone(),
                record: confirmed_record(id, resp, body),
            })
        }
        CommitPlan::Action { id, path, body } => {
            let resp = transport.post(path, body).await?;
            Ok(CommittedRow::Saved {
                previous_id: id.clone(),
                record: confirmed_record(id, resp, &Value::Null),
            })
        }
        CommitPlan::Delete { id, path } => {
            transport.delete(path).await?;
            Ok(CommittedRow::Deleted(id.clone()))
        }
    }
}

/// Server answer for an existing row; an empty or id-less body falls back to what was sent.
fn confirmed_record(id: &RecordId, resp: Value, sent: &Value) -> Record {
    if let Some(r) = Record::from_value(&resp) {
        return r;
    }
    let mut data = resp
        .as_object()
        .filter(|m| !m.is_empty())
        .cloned()
        .or_else(|| sent.as_object().cloned())
        .unwrap_or_default();
    data.entry("id".to_string())
        .or_insert_with(|| Value::String(id.as_str().to_string()));
    Record { id: id.clone(), data }
}

/// Full-roster payload: one item per record in roster order, dirty or not.
pub fn batch_payload(roster: &[Record], snapshot: &[Entry], key_field: &str) -> Vec<Value> {
    roster
        .iter()
        .map(|record| {
            let mut item = Map::new();
            item.insert(key_field.to_string(), record.raw_id());
            if let Some(entry) = snapshot.iter().find(|e| e.id == record.id) {
                for (k, v) in &entry.fields {
                    item.insert(k.clone(), v.clone());
                }
            }
            Value::Object(item)
        })
        .collect()
}

pub async fn commit_batch(
    transport: &dyn Transport,
    path: &str,
    payload: Vec<Value>,
) -> Result<(), PersistError> {
    let count = payload.len();
    transport.post(path, &Value::Array(payload)).await?;
    tracing::info!(path, count, "batch committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::buffer::EditBuffer;
    use crate::transport::scripted::ScriptedTransport;
    use serde_json::json;

    fn roster(n: usize) -> Vec<Record> {
        (1..=n)
            .map(|i| {
                Record::from_value(&json!({ "id": i, "full_name": format!("Mwanafunzi {i}") }))
                    .expect("record")
            })
            .collect()
    }

    #[tokio::test]
    async fn batch_resubmits_every_roster_row() {
        let roster = roster(5);
        let mut buffer = EditBuffer::new();
        buffer.seed(
            roster
                .iter()
                .map(|r| {
                    let fields = json!({ "is_present": false });
                    (r.id.clone(), fields.as_object().cloned().unwrap_or_default())
                }),
        );
        buffer.toggle(&RecordId::new("3"), "is_present");
        assert_eq!(buffer.dirty_count(), 1);

        let payload = batch_payload(&roster, &buffer.snapshot(), "student");
        assert_eq!(payload.len(), 5);
        assert_eq!(payload[2], json!({ "student": 3, "is_present": true }));
        assert_eq!(payload[0], json!({ "student": 1, "is_present": false }));

        let t = ScriptedTransport::default();
        t.reply("POST", "attendance/", Ok(json!([])));
        commit_batch(&t, "attendance/", payload).await.expect("commit");
        let calls = t.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.as_ref().and_then(|b| b.as_array()).map(|a| a.len()), Some(5));
    }

    #[tokio::test]
    async fn create_requires_an_id_in_the_response() {
        let t = ScriptedTransport::default();
        t.reply("POST", "lesson-plans/", Ok(json!({ "strand": "Kusoma" })));
        let plan = CommitPlan::Create {
            temp_id: RecordId::new("tmp-1"),
            path: "lesson-plans/".into(),
            body: json!({ "strand": "Kusoma" }),
        };
        let e = commit_row(&t, &plan).await.expect_err("missing id");
        assert_eq!(e, PersistError::MissingIdentifier(RecordId::new("tmp-1")));
    }

    #[tokio::test]
    async fn create_reports_server_id() {
        let t = ScriptedTransport::default();
        t.reply("POST", "lesson-plans/", Ok(json!({ "id": 42, "strand": "Kusoma" })));
        let plan = CommitPlan::Create {
            temp_id: RecordId::new("tmp-1"),
            path: "lesson-plans/".into(),
            body: json!({ "strand": "Kusoma" }),
        };
        match commit_row(&t, &plan).await.expect("created") {
            CommittedRow::Saved { previous_id, record } => {
                assert_eq!(previous_id, RecordId::new("tmp-1"));
                assert_eq!(record.id, RecordId::new("42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_with_empty_body_falls_back_to_sent_fields() {
        let t = ScriptedTransport::default();
        t.reply("PUT", "submissions/8/", Ok(Value::Null));
        let plan = CommitPlan::Update {
            id: RecordId::new("8"),
            path: "submissions/8/".into(),
            body: json!({ "score": 6.0, "feedback": "Safi" }),
        };
        let CommittedRow::Saved { record, .. } = commit_row(&t, &plan).await.expect("saved") else {
            panic!("expected saved row");
        };
        assert_eq!(record.id, RecordId::new("8"));
        assert_eq!(record.data.get("score"), Some(&json!(6.0)));
    }

    #[tokio::test]
    async fn transport_failure_is_passed_through() {
        let t = ScriptedTransport::default();
        t.reply("DELETE", "lesson-plans/3/", Err(TransportError::status(403, "forbidden")));
        let plan = CommitPlan::Delete {
            id: RecordId::new("3"),
            path: "lesson-plans/3/".into(),
        };
        let e = commit_row(&t, &plan).await.expect_err("403");
        assert!(matches!(e, PersistError::Transport(ref t) if t.status == Some(403)));
    }
}
