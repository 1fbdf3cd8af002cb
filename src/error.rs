use serde::{Deserialize, Serialize};

/// Failure while retrieving a feed document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("Connection failure for {url}: {message}")]
    ConnectionFailure { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    pub(crate) fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else {
            FetchError::ConnectionFailure {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }

    /// Timeouts and connection failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. } | FetchError::ConnectionFailure { .. }
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout { .. } => FailureKind::Timeout,
            FetchError::ConnectionFailure { .. } => FailureKind::ConnectionFailure,
            FetchError::BadStatus { .. } => FailureKind::BadStatus,
            FetchError::TooLarge { .. } => FailureKind::TooLarge,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed feed document: {0}")]
    MalformedDocument(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The store rejected a statement (constraint, decode or missing row).
    #[error("Storage rejected the operation: {0}")]
    ConstraintViolation(String),

    /// The store could not be reached at all.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PersistenceError::ConstraintViolation(_) => FailureKind::ConstraintViolation,
            PersistenceError::Unavailable(_) => FailureKind::Unavailable,
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(_)
            | sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => PersistenceError::ConstraintViolation(error.to_string()),
            _ => PersistenceError::Unavailable(error.to_string()),
        }
    }
}

/// Everything that can end a single feed's pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Refresh cancelled")]
    Cancelled,
}

impl IngestError {
    /// `None` for cancellation, which is not a failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            IngestError::Fetch(e) => Some(e.kind()),
            IngestError::Parse(ParseError::MalformedDocument(_)) => {
                Some(FailureKind::MalformedDocument)
            }
            IngestError::Persistence(e) => Some(e.kind()),
            IngestError::Cancelled => None,
        }
    }
}

/// Transport-agnostic discriminant recorded for a failed feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionFailure,
    BadStatus,
    TooLarge,
    MalformedDocument,
    ConstraintViolation,
    Unavailable,
}

pub type Result<T> = std::result::Result<T, IngestError>;
