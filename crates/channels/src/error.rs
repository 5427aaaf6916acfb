/// Crate-wide result type for channel registry operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is invalid.
    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    /// No registry entry for this `channel:accountId`.
    #[error("unknown channel account: {key}")]
    UnknownAccount { key: String },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(key: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            key: key.to_string(),
        }
    }
}
