use thiserror::Error;

/// Failures while retrieving or parsing a remote document.
///
/// All of these are transient: the affected feed is skipped and retried on
/// the next sync cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, timeout, body read)
    #[error("cannot execute request: {0}")]
    Network(#[from] reqwest::Error),
    /// Response with a non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be parsed as RSS, Atom or JSON Feed
    #[error("cannot parse feed data: {0}")]
    Parse(String),
}

/// Storage failures. Fatal for the feed being processed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("feed {0} not found")]
    FeedNotFound(i64),
    #[error("entry {0} not found")]
    EntryNotFound(i64),
}

/// A feed whose synchronization failed on the storage side.
#[derive(Debug)]
pub struct FeedFailure {
    pub feed_id: i64,
    pub feed_url: String,
    pub error: StoreError,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("error fetching feed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("feed {0} is already subscribed")]
    AlreadySubscribed(String),
    #[error(
        "got error during processing feeds ({} of {attempted} failed): {}",
        .failed.len(),
        describe_failures(.failed)
    )]
    Cycle {
        attempted: usize,
        failed: Vec<FeedFailure>,
    },
}

fn describe_failures(failed: &[FeedFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("feed {} ({}): {}", f.feed_id, f.feed_url, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
