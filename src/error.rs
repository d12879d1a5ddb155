//! Error types shared by the store, the remote client and the sync engine.

use thiserror::Error;

use crate::models::Collection;

/// Failures of the local SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not be opened. Reads degrade to empty
    /// collections; writes and saves fail with this error.
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be decoded back into its record type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{collection} record not found: {id}")]
    NotFound { collection: Collection, id: String },
}

/// Failures reported by the remote backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Duplicate-key response on an upsert. The only failure the session
    /// manager branches on.
    #[error("duplicate key: {0}")]
    Conflict(String),

    /// Validation, permission or server failure.
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("invalid payload: {0}")]
    Decode(String),
}

/// Errors surfaced by the session manager, the timesheet helpers and the
/// save workflow.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store unavailable: {0}")]
    StorageUnavailable(String),

    /// The connectivity check failed at phase start. `save` turns this into
    /// a local save; it only reaches callers of lower-level helpers.
    #[error("network unreachable")]
    NetworkUnreachable,

    /// A backend uniqueness violation. The session commit recovers from it
    /// by re-keying and escalates to `RemoteRejected` once retries run out.
    #[error("session id collision: {0}")]
    RemoteConflict(String),

    #[error("{operation} rejected by backend: {message}")]
    RemoteRejected { operation: String, message: String },

    #[error(
        "ticket upload failed for batch(es) {failed_batches:?}; {synced_tickets} ticket(s) synced"
    )]
    PartialBatchFailure {
        failed_batches: Vec<usize>,
        skipped_batches: Vec<usize>,
        synced_tickets: usize,
    },

    #[error("session {0} is completed and can no longer be edited")]
    SessionCompleted(String),

    #[error("no open timesheet entry for employee {0}")]
    NoOpenTimesheet(String),

    #[error("a save is already in progress")]
    SaveInProgress,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => SyncError::StorageUnavailable(reason),
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    /// Wrap a backend failure for `operation`. Conflicts stay distinguishable
    /// so the caller can decide whether to regenerate identifiers. A
    /// connection dropped mid-upload is a rejection: offline is only decided
    /// by the connectivity check at phase start.
    pub fn from_remote(operation: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::Conflict(message) => SyncError::RemoteConflict(message),
            other => SyncError::RemoteRejected {
                operation: operation.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// The single message shown to the employee when a save fails.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::StorageUnavailable(_) | SyncError::Store(_) => {
                "Could not save: the local database is unavailable. Restart the terminal and try again."
                    .to_string()
            }
            SyncError::NetworkUnreachable => {
                "Saved locally. Changes will upload on the next save when the connection is back."
                    .to_string()
            }
            SyncError::RemoteConflict(_) | SyncError::RemoteRejected { .. } => format!(
                "Saved locally, but the upload failed ({self}). Please try saving again."
            ),
            SyncError::PartialBatchFailure { failed_batches, .. } => format!(
                "Saved locally. Some tickets did not upload (batch {}). Please try saving again.",
                failed_batches
                    .iter()
                    .map(|i| (i + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            SyncError::SessionCompleted(_) => {
                "This shift was closed by an administrator and can no longer be changed."
                    .to_string()
            }
            SyncError::NoOpenTimesheet(_) => "You are not clocked in.".to_string(),
            SyncError::SaveInProgress => "A save is already running. Please wait.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_store_maps_to_storage_unavailable() {
        let err: SyncError = StoreError::Unavailable("disk gone".into()).into();
        assert!(matches!(err, SyncError::StorageUnavailable(ref r) if r == "disk gone"));
    }

    #[test]
    fn test_from_remote_keeps_conflict_distinct() {
        let conflict = SyncError::from_remote("session upsert", RemoteError::Conflict("23505".into()));
        assert!(matches!(conflict, SyncError::RemoteConflict(_)));

        let rejected = SyncError::from_remote(
            "ticket upload",
            RemoteError::Rejected {
                status: 403,
                message: "permission denied".into(),
            },
        );
        match rejected {
            SyncError::RemoteRejected { operation, message } => {
                assert_eq!(operation, "ticket upload");
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_partial_batch_message_is_one_based() {
        let err = SyncError::PartialBatchFailure {
            failed_batches: vec![1],
            skipped_batches: vec![2],
            synced_tickets: 5,
        };
        assert!(err.user_message().contains("batch 2"));
    }
}
