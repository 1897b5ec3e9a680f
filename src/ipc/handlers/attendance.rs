use std::collections::HashMap;

use chrono::{Local, NaiveDate};
use serde_json::{json, Map, Value};

use crate::ipc::error::{err, ok, sync_err};
use crate::ipc::helpers::{required_id, session_transport};
use crate::ipc::types::{lock, Request, SharedState};
use crate::sync::buffer::RecordId;
use crate::sync::normalize::{fold_by_key, normalize, Record};
use crate::sync::reconcile::{batch_payload, commit_batch};
use crate::sync::view::{FetchOutcome, PageSync};
use crate::sync::SyncError;
use crate::transport::{Transport, TransportError};

const STUDENTS_PATH: &str = "students/";
const TODAY_PATH: &str = "attendance/today/";
const REGISTER_PATH: &str = "attendance/";

const STUDENT_KEY: &str = "student";
const PRESENT_FIELD: &str = "is_present";

/// Daily register: the student roster plus one presence flag per student.
#[derive(Debug, Default)]
pub struct AttendancePage {
    pub sync: PageSync,
    date: Option<NaiveDate>,
}

impl AttendancePage {
    pub fn close(&mut self) {
        self.sync.close();
        self.date = None;
    }

    fn to_json(&self) -> Value {
        json!({
            "status": self.sync.status_json(),
            "date": self.date.map(|d| d.to_string()),
            "rows": self.sync.rows(),
        })
    }
}

fn presence_fields(today: &HashMap<RecordId, Value>, student: &Record) -> Map<String, Value> {
    let present = today
        .get(&student.id)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut m = Map::new();
    m.insert(PRESENT_FIELD.to_string(), Value::Bool(present));
    m
}

async fn fetch_register(
    transport: &dyn Transport,
) -> Result<(Vec<Record>, HashMap<RecordId, Value>), TransportError> {
    let roster = transport.get(STUDENTS_PATH).await?;
    let today = transport.get(TODAY_PATH).await?;
    let roster = normalize(&roster, "students");
    tracing::info!(
        students = roster.records.len(),
        shape = roster.shape.as_str(),
        "attendance roster loaded"
    );
    Ok((roster.records, fold_by_key(&today, "attendance", STUDENT_KEY, PRESENT_FIELD)))
}

async fn handle_open(state: &SharedState, req: &Request) -> serde_json::Value {
    let (transport, ticket) = {
        let mut st = lock(state);
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        (transport, st.attendance.sync.begin_fetch())
    };

    let result = fetch_register(transport.as_ref()).await;

    let mut st = lock(state);
    let page = &mut st.attendance;
    let outcome = match result {
        Ok((roster, today)) => page
            .sync
            .finish_fetch(ticket, Ok(roster), |r| presence_fields(&today, r)),
        Err(e) => page.sync.finish_fetch(ticket, Err(e), |_| Map::new()),
    };
    match outcome {
        FetchOutcome::Applied { discarded_edits } => {
            page.date = Some(Local::now().date_naive());
            let mut result = page.to_json();
            result["discardedEdits"] = json!(discarded_edits);
            ok(&req.id, result)
        }
        FetchOutcome::Failed(e) => sync_err(&req.id, &SyncError::FetchFailed(e)),
        FetchOutcome::Stale => ok(
            &req.id,
            json!({ "superseded": true, "status": page.sync.status_json() }),
        ),
    }
}

fn handle_rows(state: &SharedState, req: &Request) -> serde_json::Value {
    let st = lock(state);
    ok(&req.id, st.attendance.to_json())
}

fn handle_toggle(state: &SharedState, req: &Request) -> serde_json::Value {
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut st = lock(state);
    match st.attendance.sync.toggle(&student_id, PRESENT_FIELD) {
        Ok(present) => ok(
            &req.id,
            json!({ "studentId": student_id, "present": present, "dirty": true }),
        ),
        Err(e) => sync_err(&req.id, &e),
    }
}

fn handle_set(state: &SharedState, req: &Request) -> serde_json::Value {
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(present) = req.params.get("present").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "present must be boolean", None);
    };
    let mut st = lock(state);
    match st
        .attendance
        .sync
        .set_field(&student_id, PRESENT_FIELD, Value::Bool(present))
    {
        Ok(()) => ok(
            &req.id,
            json!({ "studentId": student_id, "present": present, "dirty": true }),
        ),
        Err(e) => sync_err(&req.id, &e),
    }
}

async fn handle_commit(state: &SharedState, req: &Request) -> serde_json::Value {
    let (transport, batch) = {
        let mut st = lock(state);
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        match st.attendance.sync.begin_batch() {
            Ok(Some(batch)) => (transport, batch),
            Ok(None) => {
                return ok(&req.id, json!({ "ignored": true, "reason": "commit in flight" }))
            }
            Err(e) => return sync_err(&req.id, &e),
        }
    };

    let payload = batch_payload(&batch.roster, &batch.snapshot, STUDENT_KEY);
    let sent = payload.len();
    let result = commit_batch(transport.as_ref(), REGISTER_PATH, payload).await;

    let mut st = lock(state);
    match st.attendance.sync.finish_batch(batch, result) {
        Ok(cleaned) => ok(
            &req.id,
            json!({
                "saved": sent,
                "cleaned": cleaned,
                "status": st.attendance.sync.status_json(),
            }),
        ),
        Err(e) => sync_err(&req.id, &e),
    }
}

pub async fn try_handle(state: &SharedState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.open" | "attendance.refresh" => Some(handle_open(state, req).await),
        "attendance.rows" => Some(handle_rows(state, req)),
        "attendance.toggle" => Some(handle_toggle(state, req)),
        "attendance.set" => Some(handle_set(state, req)),
        "attendance.commit" => Some(handle_commit(state, req).await),
        _ => None,
    }
}
