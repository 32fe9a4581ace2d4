use thiserror::Error;

/// Errors that can be returned by pocketlm-fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// An HTTP request failed (connect, TLS, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// The server rejected the resume offset (`416 Range Not Satisfiable`).
    #[error("server cannot serve bytes from offset {offset}")]
    RangeNotSatisfiable { offset: u64 },

    /// The byte stream broke off for a reason other than an HTTP error.
    #[error("connection interrupted: {message}")]
    Interrupted { message: String },

    /// A filesystem I/O error occurred (disk full, permissions, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before (or well after) the announced size.
    #[error("transfer incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// The finished file does not hash to the catalog checksum.
    #[error("checksum mismatch for {model_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        model_id: String,
        expected: String,
        actual: String,
    },

    /// A model id that cannot be used as a file name.
    #[error("invalid model id: {0:?}")]
    InvalidModelId(String),
}

/// Coarse classification used to decide between resume and user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Retryable by resuming; the partial file is kept.
    Network,
    /// Needs user action (free space, fix permissions).
    Disk,
    /// The bytes arrived but are wrong.
    Integrity,
    /// The request itself is invalid.
    Invalid,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Http(_)
            | FetchError::Status { .. }
            | FetchError::RangeNotSatisfiable { .. }
            | FetchError::Interrupted { .. }
            | FetchError::Incomplete { .. } => FetchErrorKind::Network,
            FetchError::Io(_) => FetchErrorKind::Disk,
            FetchError::ChecksumMismatch { .. } => FetchErrorKind::Integrity,
            FetchError::InvalidModelId(_) => FetchErrorKind::Invalid,
        }
    }

    /// Whether opening the transfer again has a reasonable chance to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Interrupted { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
