use thiserror::Error;

use crate::error::FetchError;

/// Result of an operation whose failure is recoverable and must not propagate.
///
/// Favicon resolution and per-feed fetching never fail hard; they either
/// produce a value or record why the work was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Skipped(SkipReason),
}

impl<T> Outcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    /// The URL has no usable scheme and host; no request was made
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("unparseable feed: {0}")]
    Unparseable(String),
    #[error("empty body")]
    EmptyBody,
    /// Server answered with a page instead of an image (soft 404)
    #[error("not an icon: content type {0}")]
    NotAnIcon(String),
    #[error("no icon link found in page")]
    NoIconLink,
}

impl From<FetchError> for SkipReason {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(e) => SkipReason::Unreachable(e.to_string()),
            FetchError::HttpStatus(status) => SkipReason::HttpStatus(status),
            FetchError::Parse(msg) => SkipReason::Unparseable(msg),
        }
    }
}
