use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid listen endpoint {endpoint:?}")]
    InvalidEndpoint { endpoint: String },

    #[error("Invalid duration {name} = {value}ms")]
    InvalidDuration { name: &'static str, value: i32 },

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Transient race (duplicate create, stale instance, arbitration in progress).
    #[error("Operation should be retried: {0}")]
    Retry(String),

    #[error("Lease relationship identifier already exists: {0}")]
    ObjectIdExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lease agent {instance} has failed")]
    AgentFailed { instance: i64 },

    #[error("Protocol revision mismatch: expected {expected_major}.{expected_minor}")]
    RevisionMismatch { expected_major: u8, expected_minor: u8 },

    #[error("Malformed lease message: {0}")]
    MalformedMessage(String),

    #[error("Stale lease message: {0}")]
    StaleMessage(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the transient class of failures a caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retry(_) | Error::InsufficientResources(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
