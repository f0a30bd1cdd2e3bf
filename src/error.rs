//! Error types for the LightRAG storage layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error ({target}): {detail}")]
    Connection { target: String, detail: String },

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Error executing graph query: {query}: {detail}")]
    GraphQuery { query: String, detail: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Namespace is not supported by this storage: {0}")]
    UnsupportedNamespace(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Graph engine failures are the only errors treated as transient.
    pub fn is_graph_query(&self) -> bool {
        matches!(self, Error::GraphQuery { .. })
    }

    pub(crate) fn graph_query(query: &str, detail: impl std::fmt::Display) -> Self {
        Error::GraphQuery {
            query: query.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Per-field decoding failure for graph labels and agtype columns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("label {0:?} is not valid hex")]
    Hex(String),

    #[error("label {0:?} is not valid UTF-8")]
    Utf8(String),

    #[error("malformed agtype value {value:?}: {reason}")]
    Agtype { value: String, reason: String },
}
