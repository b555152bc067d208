use thiserror::Error;

/// Main error type for stratadex operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// A mutable generation ran out of its entity or byte budget.
    ///
    /// Recoverable: the layered index rotates the generation and retries
    /// the operation transparently.
    #[error("generation overflow: {0}")]
    Overflow(&'static str),

    #[error("block type {given} does not match the previously defined type {expected}")]
    BlockTypeMismatch { expected: u32, given: u32 },

    #[error("serialization fault: {0}")]
    Serialization(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key dictionary error: {0}")]
    KeyDictionary(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Result type alias for stratadex operations
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Check whether this error is a recoverable generation overflow.
    ///
    /// Overflow is the only error the layered index retries; everything
    /// else propagates to the caller.
    pub fn is_overflow(&self) -> bool {
        matches!(self, StrataError::Overflow(_))
    }
}

impl From<fst::Error> for StrataError {
    fn from(e: fst::Error) -> Self {
        StrataError::KeyDictionary(e.to_string())
    }
}
