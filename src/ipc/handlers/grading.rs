use serde_json::{json, Map, Value};

use crate::ipc::error::{err, ok, sync_err};
use crate::ipc::helpers::{parse_opt_string, pick_fields, required_id, session_transport};
use crate::ipc::types::{lock, Request, SharedState};
use crate::sync::buffer::RecordId;
use crate::sync::normalize::{normalize, Record};
use crate::sync::reconcile::{commit_row, CommitPlan};
use crate::sync::view::{FetchOutcome, PageSync, RowCommit, RowOutcome};
use crate::sync::SyncError;

const SCORE_FIELD: &str = "score";
const FEEDBACK_FIELD: &str = "feedback";

/// Submissions for one assignment, graded and saved row by row.
#[derive(Debug, Default)]
pub struct GradingPage {
    pub sync: PageSync,
    assignment_id: Option<RecordId>,
}

impl GradingPage {
    pub fn close(&mut self) {
        self.sync.close();
        self.assignment_id = None;
    }

    fn to_json(&self) -> Value {
        json!({
            "status": self.sync.status_json(),
            "assignmentId": self.assignment_id,
            "rows": self.sync.rows(),
        })
    }
}

fn editable(record: &Record) -> Map<String, Value> {
    let mut m = pick_fields(record, &[SCORE_FIELD], &json!(0.0));
    m.extend(pick_fields(record, &[FEEDBACK_FIELD], &json!("")));
    m
}

fn submissions_path(assignment_id: &RecordId) -> String {
    format!("submissions/?assignment_id={}", assignment_id)
}

fn submission_path(id: &RecordId) -> String {
    format!("submissions/{}/", id)
}

/// Scores arrive from text inputs as well as numbers; anything that is not a
/// finite, non-negative number is rejected before it can reach the server.
fn coerce_score(v: Option<&Value>, key: &str) -> Result<f64, SyncError> {
    let parsed = match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(score) = parsed.filter(|s| s.is_finite()) else {
        return Err(SyncError::ValidationRejected(format!("{key} must be a number")));
    };
    if score < 0.0 {
        return Err(SyncError::ValidationRejected(format!(
            "negative {key} is not allowed"
        )));
    }
    Ok(score)
}

async fn handle_open(state: &SharedState, req: &Request) -> serde_json::Value {
    let requested = req.params.get("assignmentId").and_then(RecordId::from_value);
    let (transport, ticket, assignment_id) = {
        let mut st = lock(state);
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        let Some(assignment_id) = requested.or_else(|| st.grading.assignment_id.clone()) else {
            return err(&req.id, "bad_params", "missing assignmentId", None);
        };
        if st.grading.assignment_id.as_ref() != Some(&assignment_id) {
            st.grading.close();
            st.grading.assignment_id = Some(assignment_id.clone());
        }
        (transport, st.grading.sync.begin_fetch(), assignment_id)
    };

    let result = transport
        .get(&submissions_path(&assignment_id))
        .await
        .map(|payload| {
            let n = normalize(&payload, "submissions");
            tracing::info!(
                assignment = %assignment_id,
                submissions = n.records.len(),
                shape = n.shape.as_str(),
                "submissions loaded"
            );
            n.records
        });

    let mut st = lock(state);
    let page = &mut st.grading;
    match page.sync.finish_fetch(ticket, result, editable) {
        FetchOutcome::Applied { discarded_edits } => {
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
    ok(&req.id, st.grading.to_json())
}

fn handle_set_score(state: &SharedState, req: &Request) -> serde_json::Value {
    let submission_id = match required_id(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let score = match coerce_score(req.params.get("score"), "score") {
        Ok(v) => v,
        Err(e) => return sync_err(&req.id, &e),
    };
    let mut st = lock(state);
    match st
        .grading
        .sync
        .set_field(&submission_id, SCORE_FIELD, json!(score))
    {
        Ok(()) => ok(&req.id, json!({ "submissionId": submission_id, "score": score })),
        Err(e) => sync_err(&req.id, &e),
    }
}

fn handle_set_feedback(state: &SharedState, req: &Request) -> serde_json::Value {
    let submission_id = match required_id(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let feedback = match parse_opt_string(req.params.get("feedback")) {
        Ok(v) => v.unwrap_or_default(),
        Err(m) => return err(&req.id, "bad_params", format!("feedback {}", m), None),
    };
    let mut st = lock(state);
    match st
        .grading
        .sync
        .set_field(&submission_id, FEEDBACK_FIELD, Value::String(feedback))
    {
        Ok(()) => ok(&req.id, json!({ "submissionId": submission_id })),
        Err(e) => sync_err(&req.id, &e),
    }
}

/// Claim, send and settle one row; the page lock is released while the request is out.
async fn commit_one(
    state: &SharedState,
    req: &Request,
    id: &RecordId,
    skip_clean: bool,
    build: impl FnOnce(&RecordId, &Map<String, Value>) -> Result<CommitPlan, SyncError>,
) -> Result<Option<RowOutcome>, Value> {
    let (transport, commit): (_, RowCommit) = {
        let mut st = lock(state);
        let transport = session_transport(&st, req)?;
        match st.grading.sync.begin_row_commit(id, skip_clean, build) {
            Ok(Some(c)) => (transport, c),
            Ok(None) => return Ok(None),
            Err(e) => return Err(sync_err(&req.id, &e)),
        }
    };

    let result = commit_row(transport.as_ref(), &commit.plan).await;

    let mut st = lock(state);
    st.grading
        .sync
        .finish_row_commit(commit, result, editable)
        .map(Some)
        .map_err(|e| sync_err(&req.id, &e))
}

fn update_plan(id: &RecordId, merged: &Map<String, Value>) -> Result<CommitPlan, SyncError> {
    Ok(CommitPlan::Update {
        id: id.clone(),
        path: submission_path(id),
        body: Value::Object(merged.clone()),
    })
}

async fn handle_commit_row(state: &SharedState, req: &Request) -> serde_json::Value {
    let submission_id = match required_id(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match commit_one(state, req, &submission_id, true, update_plan).await {
        Ok(Some(_)) => {
            let st = lock(state);
            let row = st.grading.sync.rows().into_iter().find(|r| r.id == submission_id);
            ok(&req.id, json!({ "submissionId": submission_id, "saved": true, "row": row }))
        }
        Ok(None) => ok(
            &req.id,
            json!({ "submissionId": submission_id, "saved": false, "skipped": true }),
        ),
        Err(resp) => resp,
    }
}

/// Save every dirty row independently; one row failing never stops the others.
async fn handle_commit_dirty(state: &SharedState, req: &Request) -> serde_json::Value {
    let dirty = {
        let st = lock(state);
        if let Err(e) = st.grading.sync.ensure_ready() {
            return sync_err(&req.id, &e);
        }
        st.grading.sync.buffer().dirty_ids()
    };

    let mut results = Vec::with_capacity(dirty.len());
    for id in dirty {
        let outcome = commit_one(state, req, &id, true, update_plan).await;
        results.push(match outcome {
            Ok(Some(_)) => json!({ "submissionId": id, "ok": true }),
            Ok(None) => json!({ "submissionId": id, "ok": true, "skipped": true }),
            Err(resp) => json!({
                "submissionId": id,
                "ok": false,
                "error": resp.get("error").cloned(),
            }),
        });
    }
    let failed = results
        .iter()
        .filter(|r| r.get("ok").and_then(|v| v.as_bool()) == Some(false))
        .count();
    ok(
        &req.id,
        json!({ "attempted": results.len(), "failed": failed, "results": results }),
    )
}

/// Server-side grade action: adds to the auto-marked score and stores feedback.
async fn handle_award(state: &SharedState, req: &Request) -> serde_json::Value {
    let submission_id = match required_id(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let extra = match coerce_score(req.params.get("extraScore"), "extraScore") {
        Ok(v) => v,
        Err(e) => return sync_err(&req.id, &e),
    };
    let feedback = match parse_opt_string(req.params.get("feedback")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("feedback {}", m), None),
    };

    let build = |id: &RecordId, merged: &Map<String, Value>| {
        let feedback = feedback
            .clone()
            .or_else(|| merged.get(FEEDBACK_FIELD).and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_default();
        Ok(CommitPlan::Action {
            id: id.clone(),
            path: format!("{}grade/", submission_path(id)),
            body: json!({ "extra_score": extra, "feedback": feedback }),
        })
    };
    match commit_one(state, req, &submission_id, false, build).await {
        Ok(_) => {
            let st = lock(state);
            let row = st.grading.sync.rows().into_iter().find(|r| r.id == submission_id);
            ok(&req.id, json!({ "submissionId": submission_id, "row": row }))
        }
        Err(resp) => resp,
    }
}

pub async fn try_handle(state: &SharedState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.open" | "grading.refresh" => Some(handle_open(state, req).await),
        "grading.rows" => Some(handle_rows(state, req)),
        "grading.setScore" => Some(handle_set_score(state, req)),
        "grading.setFeedback" => Some(handle_set_feedback(state, req)),
        "grading.commitRow" => Some(handle_commit_row(state, req).await),
        "grading.commitDirty" => Some(handle_commit_dirty(state, req).await),
        "grading.award" => Some(handle_award(state, req).await),
        _ => None,
    }
}
