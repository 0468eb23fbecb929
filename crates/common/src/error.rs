//! Error types for wgreg

use ipnetwork::Ipv4Network;
use thiserror::Error;

/// Result type alias using wgreg Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgreg error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Address pool exhausted in subnet {subnet}")]
    PoolExhausted { subnet: Ipv4Network },

    #[error("Server is not provisioned yet")]
    NotProvisioned,

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Command `{program}` failed: {message}")]
    Command { program: String, message: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse error classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PoolExhausted,
    NotProvisioned,
    Apply,
    Entropy,
    NotFound,
    Conflict,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::NotProvisioned => ErrorKind::NotProvisioned,
            Error::Apply(_) => ErrorKind::Apply,
            Error::Entropy(_) => ErrorKind::Entropy,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::Conflict,
            Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::Io(_) | Error::Database(_) | Error::Command { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &str, id: impl ToString) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

/// A rejected field on a server or device record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Step of an apply that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    WriteConfig,
    BringDown,
    BringUp,
    Sync,
}

impl std::fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteConfig => write!(f, "writing configuration"),
            Self::BringDown => write!(f, "bringing interface down"),
            Self::BringUp => write!(f, "bringing interface up"),
            Self::Sync => write!(f, "syncing running interface"),
        }
    }
}

/// Failure writing or activating interface configuration
#[derive(Error, Debug)]
#[error("{stage} failed for {interface}: {source}")]
pub struct ApplyError {
    pub stage: ApplyStage,
    pub interface: String,
    #[source]
    pub source: Box<Error>,
}

impl ApplyError {
    pub fn new(stage: ApplyStage, interface: &str, source: Error) -> Self {
        Self {
            stage,
            interface: interface.to_string(),
            source: Box::new(source),
        }
    }
}
