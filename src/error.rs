use std::time::Duration;

use thiserror::Error;

use crate::sge::job::{JobId, JobState};

#[derive(Error, Debug)]
pub enum QsubError {
    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("queue status query failed: {0}")]
    Poll(String),

    #[error("job {id} did not finish within {timeout:?}, last seen {last}")]
    Timeout {
        id: JobId,
        timeout: Duration,
        last: JobState,
    },

    #[error("job {id} failed: {reason}")]
    JobFailed { id: JobId, reason: String },

    #[error("job {id} went from {from} back to {to}")]
    StateRegression {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job deletion failed: {0}")]
    Delete(String),

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("accounting query failed: {0}")]
    Accounting(String),

    #[error("mail dispatch failed: {0}")]
    Mail(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("job ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, QsubError>;
