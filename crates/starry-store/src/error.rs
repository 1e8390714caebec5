use starry_types::TypeError;

/// Errors from depot and file operations.
///
/// The `Display` form of each variant is the message a client sees.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("No {0}.")]
    NotFound(String),

    /// A branch does not resolve inside a document.
    #[error("{0}")]
    Addressing(String),

    /// I/O error from the underlying file system.
    #[error("Caught exception: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes do not decode into a document.
    #[error("Caught exception: corrupt document: {0}")]
    Deserialization(String),

    /// A document could not be encoded.
    #[error("Caught exception: serialization failed: {0}")]
    Serialization(String),

    /// A write landed short of its intended length.
    #[error("No space left on device.")]
    NoSpace,

    /// A corrupt or missing primary could not be restored.
    #[error("Recover {key} failed: {reason}")]
    Recovery { key: String, reason: String },

    /// Bad configuration or resource state, carried as a human-readable message.
    #[error("{0}")]
    Domain(String),

    /// The document key cannot name a file.
    #[error(transparent)]
    InvalidKey(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Why a branch failed to resolve.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Wrong container type at a segment, or a missing map key.
    #[error("Syntax error.")]
    Syntax,

    #[error("list index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("field {0:?} missing from a list element")]
    MissingField(String),
}

/// Result alias for branch navigation.
pub type PathResult<T> = Result<T, PathError>;

/// Errors from a cache backend. The depot treats every one of them as a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache protocol error: {0}")]
    Protocol(String),

    #[error("invalid cache key {0:?}")]
    InvalidKey(String),

    #[error("entry of {size} bytes exceeds cache capacity {capacity}")]
    TooLarge { size: usize, capacity: usize },

    #[error("cache rejected the entry: {0}")]
    Rejected(String),
}

/// Result alias for cache backend operations.
pub type CacheResult<T> = Result<T, CacheError>;
