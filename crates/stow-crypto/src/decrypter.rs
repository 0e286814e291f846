//! Streaming sign-decrypter
//!
//! Reads sealed chunks in arrival order, opens each one under the nonce for
//! its position, verifies the embedded signature and yields plaintext one
//! chunk at a time. Nothing from a chunk is released before it verifies.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{CryptoError, Result};
use crate::framing::{Chunk, Reassembler};
use crate::keys::{SymmetricKey, VerifyKey};
use crate::seal::ChunkOpener;
use crate::{CHUNK_OVERHEAD, CHUNK_SIZE, SEALED_CHUNK_SIZE};

#[derive(Debug, Default, Clone, Copy)]
pub struct SignDecrypter;

impl SignDecrypter {
    pub fn new() -> Self {
        SignDecrypter
    }

    pub fn decrypt<R: AsyncRead + Unpin>(
        &self,
        sealed: R,
        key: &SymmetricKey,
        verify_key: &VerifyKey,
    ) -> DecryptStream<R> {
        self.decrypt_from(sealed, key, verify_key, 0)
    }

    /// Decrypt a sealed stream whose first chunk sits at `first_index`.
    ///
    /// Used with ranged reads that start at a sealed chunk boundary.
    pub fn decrypt_from<R: AsyncRead + Unpin>(
        &self,
        sealed: R,
        key: &SymmetricKey,
        verify_key: &VerifyKey,
        first_index: u64,
    ) -> DecryptStream<R> {
        DecryptStream {
            reader: sealed,
            opener: ChunkOpener::new(key, *verify_key),
            framer: Reassembler::starting_at(CHUNK_SIZE, first_index),
            sealed_len: None,
            consumed: 0,
        }
    }
}

/// Lazy, finite, non-restartable sequence of verified plaintext chunks.
///
/// Opened chunks pass through a [`Reassembler`], which owns the ordering and
/// terminal-chunk rules.
pub struct DecryptStream<R> {
    reader: R,
    opener: ChunkOpener,
    framer: Reassembler,
    sealed_len: Option<u64>,
    consumed: u64,
}

impl<R: AsyncRead + Unpin> DecryptStream<R> {
    /// Declare how many sealed bytes the source should deliver.
    ///
    /// A source that ends short of this length is reported as truncated,
    /// even when it stops inside a chunk, and a verified stream of any other
    /// length is a framing error.
    pub fn with_sealed_len(mut self, sealed_len: u64) -> Self {
        self.sealed_len = Some(sealed_len);
        self
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.framer.is_finished() {
            return Ok(None);
        }

        let index = self.framer.expected_index();
        let mut sealed = Vec::with_capacity(SEALED_CHUNK_SIZE);
        (&mut self.reader)
            .take(SEALED_CHUNK_SIZE as u64)
            .read_to_end(&mut sealed)
            .await?;
        self.consumed += sealed.len() as u64;

        if sealed.len() < CHUNK_OVERHEAD || self.ended_early(sealed.len()) {
            warn!(
                index,
                bytes = sealed.len(),
                consumed = self.consumed,
                "sealed stream ended before terminal chunk"
            );
            // no terminal chunk yet, so this is the framer's truncation error
            return self.framer.finish().map(|()| None);
        }

        let (payload, is_last) = self.opener.open(index, &sealed)?;
        let chunk = Chunk {
            index,
            payload,
            is_last,
        };
        self.framer.push(&chunk)?;

        if is_last {
            self.ensure_exhausted(index).await?;
            debug!(chunks = index + 1, "sealed stream verified");
        }
        Ok(Some(chunk))
    }

    /// A read shorter than a full sealed chunk means the source hit EOF.
    fn ended_early(&self, read: usize) -> bool {
        read < SEALED_CHUNK_SIZE && self.sealed_len.is_some_and(|len| self.consumed < len)
    }

    async fn ensure_exhausted(&mut self, index: u64) -> Result<()> {
        let mut extra = [0u8; 1];
        if self.reader.read(&mut extra).await? != 0 {
            return Err(CryptoError::Framing(format!(
                "data follows terminal chunk {index}"
            )));
        }
        if let Some(len) = self.sealed_len.filter(|&len| len != self.consumed) {
            return Err(CryptoError::Framing(format!(
                "terminal chunk {index} ends at {} sealed bytes, expected {len}",
                self.consumed
            )));
        }
        Ok(())
    }

    /// Write every verified chunk to `sink` as soon as it verifies.
    ///
    /// On error, `sink` holds exactly the verified prefix. Returns the number
    /// of plaintext bytes written.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            sink.write_all(&chunk.payload).await?;
            written += chunk.payload.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(&mut out).await?;
        Ok(out)
    }
}
