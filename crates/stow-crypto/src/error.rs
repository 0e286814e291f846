use thiserror::Error;

use stow_core::StowError;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("integrity check failed at chunk {index}: bad seal or signature")]
    Integrity { index: u64 },

    #[error("stream truncated after {chunks} chunks without a terminal chunk")]
    Truncation { chunks: u64 },

    #[error("chunk out of order: expected index {expected}, found {found}")]
    Order { expected: u64, found: u64 },

    #[error("keys unavailable: encrypt has not been called")]
    KeysUnavailable,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for StowError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Framing(msg) => StowError::Framing(msg),
            CryptoError::Integrity { index } => StowError::Integrity { index },
            CryptoError::Truncation { chunks } => StowError::Truncation { chunks },
            CryptoError::Order { expected, found } => StowError::Order { expected, found },
            CryptoError::Io(e) => StowError::Io(e),
            other @ (CryptoError::KeysUnavailable
            | CryptoError::InvalidKey(_)
            | CryptoError::Cipher(_)) => StowError::Config(other.to_string()),
        }
    }
}
