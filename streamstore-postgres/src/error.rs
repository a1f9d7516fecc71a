use thiserror::Error;
use uuid::Uuid;

/// Represents all the ways a method can fail within the Postgres stream store.
#[derive(Error, Debug)]
pub enum Error {
    /// A request was rejected before any I/O was performed.
    #[error("{0}")]
    InvalidParameter(String),

    /// The stream changed between the caller's read and its append.
    ///
    /// Raised when `expected_version` does not match the stream head, or when
    /// two appends raced on the same stream and the retry budget (for
    /// `ExpectedVersion::Any`) is exhausted.
    #[error("concurrent modification error")]
    Concurrency,

    /// A message id in the batch is already present somewhere in the store.
    #[error("duplicate message id {0}")]
    DuplicateMessage(Uuid),

    /// A write targeted a stream whose stored type does not match. Enforced by
    /// storage; reserved.
    #[error("inconsistent stream type")]
    InconsistentStreamType,

    /// A write was attempted after `dispose()` began.
    #[error("the stream store is disposed")]
    Disposed,

    /// Error returned from the database. Never retried.
    #[error("database error")]
    Database(#[from] sqlx::Error),
}
