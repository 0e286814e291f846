use thiserror::Error;

pub type StowResult<T> = Result<T, StowError>;

/// Caller-facing failure taxonomy for asset transfers.
#[derive(Debug, Error)]
pub enum StowError {
    /// Malformed chunk sequence.
    #[error("framing error: {0}")]
    Framing(String),

    /// Seal or signature check failed. Indicates tampering or wrong keys.
    #[error("integrity check failed at chunk {index}")]
    Integrity { index: u64 },

    /// Stream ended before the terminal chunk.
    #[error("stream truncated after {chunks} chunks without a terminal chunk")]
    Truncation { chunks: u64 },

    /// Chunk authenticated at a position other than the one it arrived in.
    #[error("chunk out of order: expected index {expected}, found {found}")]
    Order { expected: u64, found: u64 },

    /// Network or storage failure.
    #[error("transfer error: {0:#}")]
    Transfer(anyhow::Error),

    /// Aborted by the caller, by cancellation, or by the progress sink.
    #[error("transfer canceled")]
    Canceled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StowError {
    /// Wrap a storage-layer failure.
    pub fn transfer(err: impl Into<anyhow::Error>) -> Self {
        StowError::Transfer(err.into())
    }

    /// Whether repeating the operation can succeed.
    ///
    /// Integrity and ordering failures mean the stream itself is bad, so
    /// retry loops must stop on them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StowError::Truncation { .. }
                | StowError::Transfer(_)
                | StowError::Canceled
                | StowError::Io(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, StowError::Canceled)
    }
}
