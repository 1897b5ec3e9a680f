use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::buffer::{EditBuffer, Entry, RecordId};
use super::normalize::Record;
use super::reconcile::{CommitPlan, CommittedRow, PersistError};
use super::SyncError;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loading,
    Error(String),
    Ready,
}

impl LoadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LoadStatus::Loading => "loading",
            LoadStatus::Error(_) => "error",
            LoadStatus::Ready => "ready",
        }
    }
}

/// Issued by `begin_fetch`; only the most recent ticket may seed the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Applied { discarded_edits: usize },
    Failed(TransportError),
    Stale,
}

/// A row commit that has claimed its in-flight slot.
#[derive(Debug, Clone)]
pub struct RowCommit {
    pub plan: CommitPlan,
    revision: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub roster: Vec<Record>,
    pub snapshot: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Saved { previous_id: RecordId, id: RecordId },
    Deleted(RecordId),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRow {
    pub id: RecordId,
    pub fields: Map<String, Value>,
    pub dirty: bool,
    pub committing: bool,
    pub draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Load status, last server state and pending edits for one page.
#[derive(Debug)]
pub struct PageSync {
    status: LoadStatus,
    latest_fetch: u64,
    records: Vec<Record>,
    buffer: EditBuffer,
    committing: HashSet<RecordId>,
    batch_in_flight: bool,
    batch_error: Option<String>,
    row_errors: HashMap<RecordId, String>,
    fetched_at: Option<DateTime<Utc>>,
}

impl Default for PageSync {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSync {
    pub fn new() -> Self {
        Self {
            status: LoadStatus::Loading,
            latest_fetch: 0,
            records: Vec::new(),
            buffer: EditBuffer::new(),
            committing: HashSet::new(),
            batch_in_flight: false,
            batch_error: None,
            row_errors: HashMap::new(),
            fetched_at: None,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    #[cfg(test)]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn buffer(&self) -> &EditBuffer {
        &self.buffer
    }

    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.latest_fetch += 1;
        self.status = LoadStatus::Loading;
        FetchTicket(self.latest_fetch)
    }

    /// Apply a fetch result unless a newer fetch was issued meanwhile.
    ///
    /// A successful fetch reseeds the buffer wholesale, discarding edits that
    /// were never committed; the count is returned so callers can surface it.
    pub fn finish_fetch<F>(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<Record>, TransportError>,
        editable: F,
    ) -> FetchOutcome
    where
        F: Fn(&Record) -> Map<String, Value>,
    {
        if ticket.0 != self.latest_fetch {
            tracing::warn!(
                ticket = ticket.0,
                latest = self.latest_fetch,
                "discarding stale fetch result"
            );
            return FetchOutcome::Stale;
        }
        match result {
            Err(e) => {
                tracing::warn!(status = ?e.status, "fetch failed: {}", e.message);
                self.status = LoadStatus::Error(e.message.clone());
                FetchOutcome::Failed(e)
            }
            Ok(records) => {
                let discarded_edits = self.buffer.dirty_count();
                if discarded_edits > 0 {
                    tracing::warn!(discarded_edits, "refetch replaced unsaved edits");
                }
                let records = dedup_by_id(records);
                self.buffer
                    .seed(records.iter().map(|r| (r.id.clone(), editable(r))));
                self.records = records;
                self.row_errors.clear();
                self.batch_error = None;
                self.fetched_at = Some(Utc::now());
                self.status = LoadStatus::Ready;
                FetchOutcome::Applied { discarded_edits }
            }
        }
    }

    pub fn ensure_ready(&self) -> Result<(), SyncError> {
        match self.status {
            LoadStatus::Ready => Ok(()),
            ref other => Err(SyncError::NotReady(other.label())),
        }
    }

    fn ensure_known(&self, id: &RecordId) -> Result<(), SyncError> {
        if self.record(id).is_some() || self.buffer.contains(id) {
            Ok(())
        } else {
            Err(SyncError::NotFound(id.clone()))
        }
    }

    pub fn set_field(&mut self, id: &RecordId, field: &str, value: Value) -> Result<(), SyncError> {
        self.ensure_ready()?;
        self.ensure_known(id)?;
        self.buffer.set_field(id, field, value);
        Ok(())
    }

    pub fn toggle(&mut self, id: &RecordId, field: &str) -> Result<bool, SyncError> {
        self.ensure_ready()?;
        self.ensure_known(id)?;
        Ok(self.buffer.toggle(id, field))
    }

    pub fn insert_draft(&mut self, fields: Map<String, Value>) -> Result<RecordId, SyncError> {
        self.ensure_ready()?;
        let id = RecordId::temporary();
        self.buffer.insert_draft(id.clone(), fields);
        Ok(id)
    }

    /// Drop local edits for a row: drafts disappear, others return to server state.
    pub fn revert<F>(&mut self, id: &RecordId, editable: F) -> Result<(), SyncError>
    where
        F: Fn(&Record) -> Map<String, Value>,
    {
        self.ensure_ready()?;
        if self.committing.contains(id) {
            return Err(SyncError::Busy(id.clone()));
        }
        match self.record(id).map(&editable) {
            Some(fields) => self.buffer.replace_fields(id, fields),
            None if self.buffer.contains(id) => {
                self.buffer.remove(id);
            }
            None => return Err(SyncError::NotFound(id.clone())),
        }
        self.row_errors.remove(id);
        Ok(())
    }

    /// Record data with pending edits laid over it.
    pub fn merged(&self, id: &RecordId) -> Option<Map<String, Value>> {
        let mut fields = self.record(id).map(|r| r.data.clone());
        if let Some(entry) = self.buffer.get(id) {
            let base = fields.get_or_insert_with(Map::new);
            for (k, v) in &entry.fields {
                base.insert(k.clone(), v.clone());
            }
        }
        fields
    }

    pub fn rows(&self) -> Vec<ViewRow> {
        let mut out: Vec<ViewRow> = self
            .records
            .iter()
            .filter_map(|r| self.view_row(&r.id))
            .collect();
        for entry in self.buffer.snapshot() {
            if self.record(&entry.id).is_none() {
                if let Some(row) = self.view_row(&entry.id) {
                    out.push(row);
                }
            }
        }
        out
    }

    fn view_row(&self, id: &RecordId) -> Option<ViewRow> {
        Some(ViewRow {
            id: id.clone(),
            fields: self.merged(id)?,
            dirty: self.buffer.is_dirty(id),
            committing: self.committing.contains(id),
            draft: self.record(id).is_none(),
            error: self.row_errors.get(id).cloned(),
        })
    }

    /// Claim the in-flight slot for `id` and build its request.
    ///
    /// Returns `Ok(None)` when `skip_clean` is set and the row has nothing to save.
    pub fn begin_row_commit<F>(
        &mut self,
        id: &RecordId,
        skip_clean: bool,
        build: F,
    ) -> Result<Option<RowCommit>, SyncError>
    where
        F: FnOnce(&RecordId, &Map<String, Value>) -> Result<CommitPlan, SyncError>,
    {
        self.ensure_ready()?;
        if self.committing.contains(id) {
            return Err(SyncError::Busy(id.clone()));
        }
        let merged = self.merged(id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if skip_clean && !id.is_temporary() && !self.buffer.is_dirty(id) {
            return Ok(None);
        }
        let plan = build(id, &merged)?;
        self.committing.insert(id.clone());
        tracing::info!(row = %id, verb = plan.verb(), "row commit started");
        Ok(Some(RowCommit {
            plan,
            revision: self.buffer.revision(id),
        }))
    }

    pub fn finish_row_commit<F>(
        &mut self,
        commit: RowCommit,
        result: Result<CommittedRow, PersistError>,
        editable: F,
    ) -> Result<RowOutcome, SyncError>
    where
        F: Fn(&Record) -> Map<String, Value>,
    {
        let id = commit.plan.id().clone();
        self.committing.remove(&id);

        match result {
            Err(source) => {
                tracing::warn!(row = %id, "row commit failed: {source}");
                self.row_errors.insert(id.clone(), source.to_string());
                Err(SyncError::CommitFailed { row: Some(id), source })
            }
            Ok(CommittedRow::Deleted(deleted)) => {
                self.records.retain(|r| r.id != deleted);
                self.buffer.remove(&deleted);
                self.row_errors.remove(&deleted);
                Ok(RowOutcome::Deleted(deleted))
            }
            Ok(CommittedRow::Saved { previous_id, record }) => {
                let new_id = record.id.clone();
                self.row_errors.remove(&previous_id);
                let unchanged = self.buffer.revision(&previous_id) == commit.revision;
                let had_entry = self.buffer.contains(&previous_id);

                if previous_id != new_id {
                    self.buffer.rekey(&previous_id, &new_id);
                }
                let fields = editable(&record);
                match self.records.iter_mut().find(|r| r.id == previous_id || r.id == new_id) {
                    Some(slot) => *slot = record,
                    None if previous_id.is_temporary() && had_entry => self.records.push(record),
                    None => {
                        // A newer fetch or a close dropped this row; the next fetch lists it again.
                        tracing::debug!(row = %new_id, "committed row absent from current records");
                        return Ok(RowOutcome::Saved { previous_id, id: new_id });
                    }
                }

                if unchanged || !self.buffer.contains(&new_id) {
                    self.buffer.replace_fields(&new_id, fields);
                } else {
                    tracing::info!(
                        row = %new_id,
                        "row edited while saving; keeping newer local edits"
                    );
                }
                Ok(RowOutcome::Saved { previous_id, id: new_id })
            }
        }
    }

    /// Snapshot the full roster for a batch commit; `None` while one is already outstanding.
    pub fn begin_batch(&mut self) -> Result<Option<BatchCommit>, SyncError> {
        self.ensure_ready()?;
        if self.batch_in_flight {
            tracing::debug!("batch commit already in flight; ignoring trigger");
            return Ok(None);
        }
        self.batch_in_flight = true;
        Ok(Some(BatchCommit {
            roster: self.records.clone(),
            snapshot: self.buffer.snapshot(),
        }))
    }

    pub fn finish_batch(
        &mut self,
        batch: BatchCommit,
        result: Result<(), PersistError>,
    ) -> Result<usize, SyncError> {
        self.batch_in_flight = false;
        match result {
            Ok(()) => {
                let cleaned = self.buffer.mark_all_clean(&batch.snapshot);
                self.batch_error = None;
                Ok(cleaned)
            }
            Err(source) => {
                tracing::warn!("batch commit failed: {source}");
                self.batch_error = Some(source.to_string());
                Err(SyncError::CommitFailed { row: None, source })
            }
        }
    }

    #[cfg(test)]
    pub fn is_committing(&self, id: &RecordId) -> bool {
        self.committing.contains(id)
    }

    /// Page unmount: forget everything and invalidate outstanding fetches.
    pub fn close(&mut self) {
        self.latest_fetch += 1;
        self.status = LoadStatus::Loading;
        self.records.clear();
        self.buffer.clear();
        self.row_errors.clear();
        self.batch_error = None;
        self.fetched_at = None;
    }

    pub fn status_json(&self) -> Value {
        let message = match &self.status {
            LoadStatus::Error(m) => Some(m.clone()),
            _ => None,
        };
        json!({
            "state": self.status.label(),
            "message": message,
            "fetchedAt": self.fetched_at.map(|t| t.to_rfc3339()),
            "dirtyCount": self.buffer.dirty_count(),
            "batchInFlight": self.batch_in_flight,
            "batchError": self.batch_error,
        })
    }
}

/// One record per id: the first occurrence keeps its position, the last one's data wins.
fn dedup_by_id(records: Vec<Record>) -> Vec<Record> {
    let mut index: HashMap<RecordId, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.id) {
            Some(&i) => {
                tracing::warn!(id = %record.id, "duplicate id in payload; keeping later data");
                out[i] = record;
            }
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Read-side filter and sort over view rows; never touches the buffer.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub search: String,
    pub search_fields: Vec<String>,
    pub sort_key: Option<String>,
    pub ascending: bool,
}

pub fn project(rows: Vec<ViewRow>, p: &Projection) -> Vec<ViewRow> {
    let needle = p.search.trim().to_lowercase();
    let mut out: Vec<ViewRow> = rows
        .into_iter()
        .filter(|row| {
            needle.is_empty()
                || p.search_fields.iter().any(|f| {
                    row.fields
                        .get(f)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
        })
        .collect();

    if let Some(key) = p.sort_key.as_deref() {
        // sort_by is stable, so equal keys keep their prior relative order in both directions.
        out.sort_by(|a, b| {
            let ord = compare_values(a.fields.get(key), b.fields.get(key));
            if p.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }
    out
}

fn kind_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}
