use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the raw-data storage layer.
///
/// `InvalidArgument` and `PageNotFound` are local and recoverable; the caller
/// keeps its transaction. `Corruption` and `Unrecoverable` are fatal: the
/// enclosing transaction must abort, since continuing risks cross-linking
/// unrelated data.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller passed a value the operation cannot act on. Nothing was
    /// mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A page number outside the transaction's allocated range.
    #[error("page {0} not found")]
    PageNotFound(u64),
    /// Stored bytes disagree with their own bookkeeping.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Structural damage found while rewriting a page. The database cannot
    /// continue safely.
    #[error("unrecoverable storage error: {0}")]
    Unrecoverable(String),
    /// A stored entry failed to decompress.
    #[error("compression: {0}")]
    Compression(#[from] snap::Error),
}
