use serde_json::{json, Map, Value};

use crate::ipc::error::{err, ok, sync_err};
use crate::ipc::helpers::{
    optional_id, parse_opt_bool, parse_opt_string, pick_fields, required_id, required_str,
    session_transport,
};
use crate::ipc::types::{lock, Request, SharedState};
use crate::sync::buffer::RecordId;
use crate::sync::normalize::{normalize, Record};
use crate::sync::reconcile::{commit_row, CommitPlan};
use crate::sync::view::{project, FetchOutcome, PageSync, Projection, RowOutcome};
use crate::sync::SyncError;

const PLANS_PATH: &str = "lesson-plans/";

const PLAN_FIELDS: [&str; 12] = [
    "strand",
    "sub_strand",
    "general_outcome",
    "specific_outcome_1",
    "specific_outcome_2",
    "specific_outcome_3",
    "enquiry_question",
    "introduction",
    "lesson_development",
    "conclusion",
    "reflection",
    "assignment",
];
const SEARCH_FIELDS: [&str; 2] = ["strand", "general_outcome"];
const REQUIRED_FIELDS: [&str; 3] = ["strand", "sub_strand", "general_outcome"];
const DEFAULT_SORT_KEY: &str = "strand";

/// Lesson plan list with search, sort, expandable rows and a single edit selection.
#[derive(Debug)]
pub struct LessonPlanPage {
    pub sync: PageSync,
    search: String,
    sort_key: String,
    sort_asc: bool,
    expanded: Vec<RecordId>,
    editing: Option<RecordId>,
}

impl Default for LessonPlanPage {
    fn default() -> Self {
        Self {
            sync: PageSync::default(),
            search: String::new(),
            sort_key: DEFAULT_SORT_KEY.to_string(),
            sort_asc: true,
            expanded: Vec::new(),
            editing: None,
        }
    }
}

impl LessonPlanPage {
    pub fn close(&mut self) {
        self.sync.close();
        self.expanded.clear();
        self.editing = None;
    }

    fn projection(&self) -> Projection {
        Projection {
            search: self.search.clone(),
            search_fields: SEARCH_FIELDS.iter().map(|f| f.to_string()).collect(),
            sort_key: Some(self.sort_key.clone()),
            ascending: self.sort_asc,
        }
    }

    fn to_json(&self) -> Value {
        let rows: Vec<Value> = project(self.sync.rows(), &self.projection())
            .into_iter()
            .map(|row| {
                let expanded = self.expanded.contains(&row.id);
                let editing = self.editing.as_ref() == Some(&row.id);
                let mut v = json!(row);
                v["expanded"] = json!(expanded);
                v["editing"] = json!(editing);
                v
            })
            .collect();
        json!({
            "status": self.sync.status_json(),
            "search": self.search,
            "sortKey": self.sort_key,
            "sortAsc": self.sort_asc,
            "editingId": self.editing,
            "total": self.sync.rows().len(),
            "rows": rows,
        })
    }

    /// Drop selection state that points at rows no longer on the page.
    fn prune_selection(&mut self) {
        let sync = &self.sync;
        self.expanded.retain(|id| sync.merged(id).is_some());
        if let Some(id) = &self.editing {
            if sync.merged(id).is_none() {
                self.editing = None;
            }
        }
    }

    fn rename(&mut self, from: &RecordId, to: &RecordId) {
        for id in self.expanded.iter_mut().filter(|id| **id == *from) {
            *id = to.clone();
        }
        if self.editing.as_ref() == Some(from) {
            self.editing = Some(to.clone());
        }
    }

    fn forget(&mut self, id: &RecordId) {
        self.expanded.retain(|e| e != id);
        if self.editing.as_ref() == Some(id) {
            self.editing = None;
        }
    }
}

fn editable(record: &Record) -> Map<String, Value> {
    pick_fields(record, &PLAN_FIELDS, &json!(""))
}

fn plan_path(id: &RecordId) -> String {
    format!("{}{}/", PLANS_PATH, id)
}

fn is_plan_field(field: &str) -> bool {
    PLAN_FIELDS.contains(&field)
}

fn field_text(v: Option<&Value>, field: &str) -> Result<String, SyncError> {
    parse_opt_string(v)
        .map(Option::unwrap_or_default)
        .map_err(|m| SyncError::ValidationRejected(format!("{field} {m}")))
}

fn missing_required(merged: &Map<String, Value>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| {
            merged
                .get(*f)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        })
        .collect()
}

/// Create for drafts, full update otherwise; incomplete plans never leave the process.
fn save_plan(id: &RecordId, merged: &Map<String, Value>) -> Result<CommitPlan, SyncError> {
    let missing = missing_required(merged);
    if !missing.is_empty() {
        return Err(SyncError::ValidationRejected(format!(
            "required fields are empty: {}",
            missing.join(", ")
        )));
    }
    let body: Map<String, Value> = if id.is_temporary() {
        PLAN_FIELDS
            .iter()
            .filter_map(|f| merged.get(*f).map(|v| (f.to_string(), v.clone())))
            .collect()
    } else {
        merged.clone()
    };
    Ok(if id.is_temporary() {
        CommitPlan::Create {
            temp_id: id.clone(),
            path: PLANS_PATH.to_string(),
            body: Value::Object(body),
        }
    } else {
        CommitPlan::Update {
            id: id.clone(),
            path: plan_path(id),
            body: Value::Object(body),
        }
    })
}

async fn handle_open(state: &SharedState, req: &Request) -> serde_json::Value {
    let (transport, ticket) = {
        let mut st = lock(state);
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        (transport, st.plans.sync.begin_fetch())
    };

    let result = transport.get(PLANS_PATH).await.map(|payload| {
        let n = normalize(&payload, "lesson_plans");
        tracing::info!(
            plans = n.records.len(),
            skipped = n.skipped,
            shape = n.shape.as_str(),
            "lesson plans loaded"
        );
        n.records
    });

    let mut st = lock(state);
    let page = &mut st.plans;
    match page.sync.finish_fetch(ticket, result, editable) {
        FetchOutcome::Applied { discarded_edits } => {
            page.prune_selection();
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
    let search = match parse_opt_string(req.params.get("search")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("search {}", m), None),
    };
    let sort_key = match parse_opt_string(req.params.get("sortKey")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("sortKey {}", m), None),
    };
    let sort_asc = match parse_opt_bool(req.params.get("sortAsc")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("sortAsc {}", m), None),
    };
    if let Some(key) = sort_key.as_deref() {
        if !is_plan_field(key) {
            return err(&req.id, "bad_params", "unknown sortKey", Some(json!({ "sortKey": key })));
        }
    }

    let mut st = lock(state);
    let page = &mut st.plans;
    if let Some(s) = search {
        page.search = s;
    }
    if let Some(k) = sort_key {
        page.sort_key = k;
    }
    if let Some(a) = sort_asc {
        page.sort_asc = a;
    }
    ok(&req.id, page.to_json())
}

fn handle_toggle_sort(state: &SharedState, req: &Request) -> serde_json::Value {
    let key = match required_str(req, "sortKey") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !is_plan_field(&key) {
        return err(&req.id, "bad_params", "unknown sortKey", Some(json!({ "sortKey": key })));
    }
    let mut st = lock(state);
    let page = &mut st.plans;
    if page.sort_key == key {
        page.sort_asc = !page.sort_asc;
    } else {
        page.sort_key = key;
        page.sort_asc = true;
    }
    ok(&req.id, page.to_json())
}

fn handle_set_field(state: &SharedState, req: &Request) -> serde_json::Value {
    let plan_id = match required_id(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let field = match required_str(req, "field") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !is_plan_field(&field) {
        let e = SyncError::ValidationRejected(format!("unknown lesson plan field: {field}"));
        return sync_err(&req.id, &e);
    }
    let value = match field_text(req.params.get("value"), &field) {
        Ok(v) => v,
        Err(e) => return sync_err(&req.id, &e),
    };
    let mut st = lock(state);
    match st.plans.sync.set_field(&plan_id, &field, Value::String(value)) {
        Ok(()) => ok(&req.id, json!({ "planId": plan_id, "field": field, "dirty": true })),
        Err(e) => sync_err(&req.id, &e),
    }
}

fn handle_create(state: &SharedState, req: &Request) -> serde_json::Value {
    let mut fields: Map<String, Value> = PLAN_FIELDS
        .iter()
        .map(|f| (f.to_string(), Value::String(String::new())))
        .collect();
    if let Some(initial) = req.params.get("fields") {
        let Some(obj) = initial.as_object() else {
            return err(&req.id, "bad_params", "fields must be an object", None);
        };
        for (k, v) in obj {
            if !is_plan_field(k) {
                let e = SyncError::ValidationRejected(format!("unknown lesson plan field: {k}"));
                return sync_err(&req.id, &e);
            }
            match field_text(Some(v), k) {
                Ok(text) => {
                    fields.insert(k.clone(), Value::String(text));
                }
                Err(e) => return sync_err(&req.id, &e),
            }
        }
    }

    let mut st = lock(state);
    let page = &mut st.plans;
    match page.sync.insert_draft(fields) {
        Ok(plan_id) => {
            page.editing = Some(plan_id.clone());
            ok(&req.id, json!({ "planId": plan_id, "editing": true }))
        }
        Err(e) => sync_err(&req.id, &e),
    }
}

fn handle_edit(state: &SharedState, req: &Request) -> serde_json::Value {
    let plan_id = match required_id(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut st = lock(state);
    let page = &mut st.plans;
    if let Err(e) = page.sync.ensure_ready() {
        return sync_err(&req.id, &e);
    }
    let Some(row) = page.sync.merged(&plan_id) else {
        return sync_err(&req.id, &SyncError::NotFound(plan_id));
    };
    page.editing = Some(plan_id.clone());
    ok(&req.id, json!({ "planId": plan_id, "fields": row }))
}

fn handle_cancel(state: &SharedState, req: &Request) -> serde_json::Value {
    let mut st = lock(state);
    let page = &mut st.plans;
    let Some(plan_id) = optional_id(req, "planId").or_else(|| page.editing.clone()) else {
        return ok(&req.id, json!({ "cancelled": false }));
    };
    if let Err(e) = page.sync.revert(&plan_id, editable) {
        return sync_err(&req.id, &e);
    }
    if plan_id.is_temporary() {
        page.forget(&plan_id);
    } else if page.editing.as_ref() == Some(&plan_id) {
        page.editing = None;
    }
    ok(&req.id, json!({ "planId": plan_id, "cancelled": true }))
}

fn handle_toggle_expanded(state: &SharedState, req: &Request) -> serde_json::Value {
    let plan_id = match required_id(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut st = lock(state);
    let page = &mut st.plans;
    if page.sync.merged(&plan_id).is_none() {
        return sync_err(&req.id, &SyncError::NotFound(plan_id));
    }
    let expanded = match page.expanded.iter().position(|e| *e == plan_id) {
        Some(i) => {
            page.expanded.remove(i);
            false
        }
        None => {
            page.expanded.push(plan_id.clone());
            true
        }
    };
    ok(&req.id, json!({ "planId": plan_id, "expanded": expanded }))
}

async fn handle_commit_row(state: &SharedState, req: &Request) -> serde_json::Value {
    let plan_id = match required_id(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (transport, commit) = {
        let mut st = lock(state);
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        match st.plans.sync.begin_row_commit(&plan_id, true, save_plan) {
            Ok(Some(c)) => (transport, c),
            Ok(None) => {
                if st.plans.editing.as_ref() == Some(&plan_id) {
                    st.plans.editing = None;
                }
                return ok(&req.id, json!({ "planId": plan_id, "saved": false, "skipped": true }));
            }
            Err(e) => return sync_err(&req.id, &e),
        }
    };

    let result = commit_row(transport.as_ref(), &commit.plan).await;

    let mut st = lock(state);
    let page = &mut st.plans;
    match page.sync.finish_row_commit(commit, result, editable) {
        Ok(RowOutcome::Saved { previous_id, id }) => {
            if previous_id != id {
                tracing::info!(temp = %previous_id, id = %id, "lesson plan created");
                page.rename(&previous_id, &id);
            }
            if page.editing.as_ref() == Some(&id) && !page.sync.buffer().is_dirty(&id) {
                page.editing = None;
            }
            ok(
                &req.id,
                json!({ "planId": id, "previousId": previous_id, "saved": true }),
            )
        }
        Ok(RowOutcome::Deleted(id)) => {
            page.forget(&id);
            ok(&req.id, json!({ "planId": id, "deleted": true }))
        }
        Err(e) => sync_err(&req.id, &e),
    }
}

async fn handle_delete(state: &SharedState, req: &Request) -> serde_json::Value {
    let plan_id = match required_id(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (transport, commit) = {
        let mut st = lock(state);
        let page = &mut st.plans;
        if plan_id.is_temporary() {
            // Never sent to the server; dropping the draft is enough.
            return match page.sync.revert(&plan_id, editable) {
                Ok(()) => {
                    page.forget(&plan_id);
                    ok(&req.id, json!({ "planId": plan_id, "deleted": true }))
                }
                Err(e) => sync_err(&req.id, &e),
            };
        }
        let transport = match session_transport(&st, req) {
            Ok(t) => t,
            Err(e) => return e,
        };
        let delete = |id: &RecordId, _: &Map<String, Value>| {
            Ok(CommitPlan::Delete {
                id: id.clone(),
                path: plan_path(id),
            })
        };
        match st.plans.sync.begin_row_commit(&plan_id, false, delete) {
            Ok(Some(c)) => (transport, c),
            Ok(None) => return ok(&req.id, json!({ "planId": plan_id, "deleted": false })),
            Err(e) => return sync_err(&req.id, &e),
        }
    };

    let result = commit_row(transport.as_ref(), &commit.plan).await;

    let mut st = lock(state);
    let page = &mut st.plans;
    match page.sync.finish_row_commit(commit, result, editable) {
        Ok(_) => {
            page.forget(&plan_id);
            ok(&req.id, json!({ "planId": plan_id, "deleted": true }))
        }
        Err(e) => sync_err(&req.id, &e),
    }
}

pub async fn try_handle(state: &SharedState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plans.open" | "plans.refresh" => Some(handle_open(state, req).await),
        "plans.rows" => Some(handle_rows(state, req)),
        "plans.toggleSort" => Some(handle_toggle_sort(state, req)),
        "plans.setField" => Some(handle_set_field(state, req)),
        "plans.create" => Some(handle_create(state, req)),
        "plans.edit" => Some(handle_edit(state, req)),
        "plans.cancel" => Some(handle_cancel(state, req)),
        "plans.toggleExpanded" => Some(handle_toggle_expanded(state, req)),
        "plans.commitRow" => Some(handle_commit_row(state, req).await),
        "plans.delete" => Some(handle_delete(state, req).await),
        _ => None,
    }
}
