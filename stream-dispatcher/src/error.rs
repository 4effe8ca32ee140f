use std::time::Duration;

use thiserror::Error;

use crate::types::DataId;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] assignment_coordination::error::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no worker nodes available")]
    NoNodes,

    #[error("no dispatch plan for service {0}")]
    MissingTransfer(String),

    #[error("source pair not found: {0}")]
    MissingSource(String),

    #[error("invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("work unit {data_id} failed: {reason}")]
    WorkUnit { data_id: DataId, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("nothing to dispatch: {0}")]
    EmptyInput(&'static str),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.into())
    }
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Store(assignment_coordination::error::Error::InvalidState(
            msg.into(),
        ))
    }

    pub fn invalid_record(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn work_unit(data_id: DataId, reason: impl ToString) -> Self {
        Self::WorkUnit {
            data_id,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
