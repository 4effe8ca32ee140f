use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("leadership lost")]
    LeadershipLost,

    #[error("coordination store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
