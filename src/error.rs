use thiserror::Error;

use crate::model::SessionStatus;

/// Errors surfaced by the session coordinator. Cloneable so every caller of a
/// shared submission receives the same outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Exam metadata could not be fetched. Fatal, not retried.
    #[error("exam definition unavailable: {0}")]
    DefinitionUnavailable(String),

    /// Both creating a session and recovering an existing one failed.
    #[error("could not acquire an exam session: {0}")]
    SessionAcquisitionFailed(String),

    /// A flush did not reach the server. Retried on the next flush.
    #[error("answer sync failed: {0}")]
    SyncFailed(String),

    /// The server rejected or errored on the final submission.
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("cannot {operation} while session is {status}")]
    InvalidTransition {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("unknown question: {0}")]
    UnknownQuestion(String),

    #[error("answer does not fit question {0}")]
    InvalidAnswer(String),

    #[error("invalid exam id: {0:?}")]
    InvalidExamId(String),

    #[error("local storage error: {0}")]
    Storage(String),
}

/// Failures talking to the remote exam service.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The server answered with `success: false`.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Failures of the persisted local store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode stored value: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Storage(err.to_string())
    }
}
