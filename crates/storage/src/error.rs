use switchyard_protocol::ErrorShape;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("write exceeds declared size: {expected} bytes declared, {attempted} attempted")]
    Overflow { expected: u64, attempted: u64 },
    #[error("short write: {expected} bytes declared, {written} received")]
    ShortWrite { expected: u64, written: u64 },
    #[error("write aborted")]
    Aborted,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<Error> for ErrorShape {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => Self::not_found(err.to_string()),
            Error::InvalidKey { .. } => Self::bad_request(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
