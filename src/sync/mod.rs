//! Client-side synchronization of server-owned collections: envelope
//! normalization, the local edit buffer, reconciliation back to the API and
//! the per-page load/commit state machine.

pub mod buffer;
pub mod normalize;
pub mod reconcile;
pub mod view;

use serde_json::{json, Value};
use thiserror::Error;

use crate::transport::TransportError;
use buffer::RecordId;
use reconcile::PersistError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("failed to load: {0}")]
    FetchFailed(TransportError),
    #[error("failed to save{}: {source}", row_suffix(.row))]
    CommitFailed {
        row: Option<RecordId>,
        source: PersistError,
    },
    #[error("{0}")]
    ValidationRejected(String),
    #[error("page is {0}; edits are accepted only when ready")]
    NotReady(&'static str),
    #[error("{0} is already being saved")]
    Busy(RecordId),
    #[error("unknown row {0}")]
    NotFound(RecordId),
}

fn row_suffix(row: &Option<RecordId>) -> String {
    row.as_ref().map(|r| format!(" row {r}")).unwrap_or_default()
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::FetchFailed(_) => "fetch_failed",
            SyncError::CommitFailed { .. } => "commit_failed",
            SyncError::ValidationRejected(_) => "validation_rejected",
            SyncError::NotReady(_) => "not_ready",
            SyncError::Busy(_) => "busy",
            SyncError::NotFound(_) => "not_found",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            SyncError::FetchFailed(e) => Some(e.details()),
            SyncError::CommitFailed { row, source } => {
                let mut d = source.details();
                if let Some(obj) = d.as_object_mut() {
                    obj.insert("row".into(), json!(row));
                }
                Some(d)
            }
            SyncError::Busy(id) | SyncError::NotFound(id) => Some(json!({ "row": id })),
            SyncError::ValidationRejected(_) | SyncError::NotReady(_) => None,
        }
    }
}
