//! Error types for coins view operations.

/// Errors surfaced by a coins view.
///
/// Logic-invariant violations (overwriting an unspent coin, a misapplied
/// FRESH flag, an incomplete erase on flush) are caller bugs and panic
/// instead of being reported here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lower layer failed to read an entry.
    #[error("backing store read failed: {0}")]
    Read(String),

    /// The view does not support bulk writes.
    #[error("batch write is not supported by this view")]
    BatchWriteUnsupported,

    /// IO error from a durable store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
