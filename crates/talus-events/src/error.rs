use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

/// Failure surface of the talus repositories. The first two variants reject
/// a request before any query is issued; the latter two happen after
/// validation passed.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Malformed caller input: an empty id, an inverted time range, a
    /// severity outside 1..=5.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    /// Pagination token that fails to decode or was issued for a different
    /// filter.
    #[error("bad cursor: {0}")]
    BadCursor(String),
    /// ClickHouse rejected or failed the request.
    #[error("storage backend: {0}")]
    Storage(String),
    /// Local serialization fault (cursor encode, artifact encode).
    #[error("internal: {0}")]
    Internal(String),
}

impl RepoError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn bad_cursor(reason: impl Into<String>) -> Self {
        Self::BadCursor(reason.into())
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}
