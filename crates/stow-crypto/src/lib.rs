//! stow-crypto: streaming sign-then-encrypt codec for chat attachments
//!
//! Each plaintext chunk is signed with a per-asset ed25519 key and sealed with
//! XChaCha20-Poly1305 under a per-asset symmetric key:
//!
//! ```text
//! signature = ed25519_sign(signing_key, context || index_be || is_last || payload)
//! sealed    = xchacha20poly1305_seal(key, nonce(index, is_last), signature || payload)
//! ```
//!
//! Sealed chunk layout on the wire (no framing bytes between chunks):
//! ```text
//! [64 bytes: signature][N bytes: payload]  (encrypted)  [16 bytes: Poly1305 tag]
//! ```
//!
//! Nonces are a pure function of the chunk position, so re-sealing the same
//! plaintext with the same key material reproduces the same bytes. Uploads
//! rely on this to resume without re-sending parts storage already holds.

pub mod decrypter;
pub mod encrypter;
pub mod error;
pub mod framing;
pub mod keys;
pub mod nonce;
pub mod seal;

#[cfg(test)]
mod proptests;

pub use decrypter::{DecryptStream, SignDecrypter};
pub use encrypter::{EncryptStream, SignEncrypter};
pub use error::{CryptoError, Result};
pub use framing::{
    chunk_count, encrypted_len, plaintext_len, reassemble, sealed_offset, Chunk, ChunkSplitter,
    Reassembler,
};
pub use keys::{AssetKeys, SigningKeyPair, SymmetricKey, VerifyKey};
pub use seal::{ChunkOpener, ChunkSealer, SealedChunk};

/// Plaintext bytes per chunk (1 MiB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a detached ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Bytes added to every chunk by sealing
pub const CHUNK_OVERHEAD: usize = SIGNATURE_SIZE + TAG_SIZE;

/// Sealed size of a full chunk
pub const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + CHUNK_OVERHEAD;
