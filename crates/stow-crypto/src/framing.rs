//! Fixed-size chunk framing
//!
//! A plaintext of length `n` is split into `n / CHUNK_SIZE + 1` chunks. Every
//! chunk except the last carries exactly `CHUNK_SIZE` bytes. The last chunk is
//! short, which means an empty terminal chunk is emitted whenever `n` is a
//! multiple of `CHUNK_SIZE` (including `n == 0`).

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CryptoError, Result};
use crate::{CHUNK_OVERHEAD, CHUNK_SIZE, SEALED_CHUNK_SIZE};

/// One plaintext chunk and its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub payload: Vec<u8>,
    pub is_last: bool,
}

/// Number of chunks produced for `plaintext_len` bytes.
pub fn chunk_count(plaintext_len: u64) -> u64 {
    plaintext_len / CHUNK_SIZE as u64 + 1
}

/// Sealed length for `plaintext_len` bytes of plaintext.
pub fn encrypted_len(plaintext_len: u64) -> u64 {
    plaintext_len + chunk_count(plaintext_len) * CHUNK_OVERHEAD as u64
}

/// Inverse of [`encrypted_len`]. Returns `None` if no plaintext length seals
/// to `sealed_len`.
pub fn plaintext_len(sealed_len: u64) -> Option<u64> {
    let full = sealed_len / SEALED_CHUNK_SIZE as u64;
    let rem = sealed_len % SEALED_CHUNK_SIZE as u64;
    if rem < CHUNK_OVERHEAD as u64 {
        return None;
    }
    Some(full * CHUNK_SIZE as u64 + rem - CHUNK_OVERHEAD as u64)
}

/// Byte offset of sealed chunk `index` within the sealed stream.
pub fn sealed_offset(index: u64) -> u64 {
    index * SEALED_CHUNK_SIZE as u64
}

/// Lazily splits an async reader into [`Chunk`]s.
///
/// Not restartable: once the terminal chunk has been returned every further
/// call yields `None`. Re-deriving the sequence requires a fresh reader.
pub struct ChunkSplitter<R> {
    reader: R,
    chunk_size: usize,
    next_index: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkSplitter<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            done: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut payload = Vec::with_capacity(self.chunk_size);
        (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut payload)
            .await?;

        let is_last = payload.len() < self.chunk_size;
        let chunk = Chunk {
            index: self.next_index,
            payload,
            is_last,
        };
        self.next_index += 1;
        self.done = is_last;
        Ok(Some(chunk))
    }

}

/// Incremental validator for a chunk sequence.
///
/// Enforces contiguous ascending indices from `first_index`, full payloads
/// on every non-terminal chunk, and exactly one terminal chunk at the end.
#[derive(Debug)]
pub struct Reassembler {
    chunk_size: usize,
    expected: u64,
    finished: bool,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self::starting_at(chunk_size, 0)
    }

    pub fn starting_at(chunk_size: usize, first_index: u64) -> Self {
        Self {
            chunk_size,
            expected: first_index,
            finished: false,
        }
    }

    /// Validate `chunk` and return its payload.
    pub fn push<'a>(&mut self, chunk: &'a Chunk) -> Result<&'a [u8]> {
        if self.finished {
            return Err(CryptoError::Framing(format!(
                "chunk {} follows the terminal chunk",
                chunk.index
            )));
        }
        if chunk.index != self.expected {
            return Err(CryptoError::Order {
                expected: self.expected,
                found: chunk.index,
            });
        }
        if chunk.payload.len() > self.chunk_size {
            return Err(CryptoError::Framing(format!(
                "chunk {} carries {} bytes (max {})",
                chunk.index,
                chunk.payload.len(),
                self.chunk_size
            )));
        }
        if !chunk.is_last && chunk.payload.len() != self.chunk_size {
            return Err(CryptoError::Framing(format!(
                "non-terminal chunk {} carries {} bytes (expected {})",
                chunk.index,
                chunk.payload.len(),
                self.chunk_size
            )));
        }

        self.expected += 1;
        self.finished = chunk.is_last;
        Ok(&chunk.payload)
    }

    /// Confirm the terminal chunk was seen.
    pub fn finish(&self) -> Result<()> {
        if self.finished {
            Ok(())
        } else {
            Err(CryptoError::Truncation {
                chunks: self.expected,
            })
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Index the next pushed chunk must carry.
    pub fn expected_index(&self) -> u64 {
        self.expected
    }
}

/// Rebuild the byte stream from a complete chunk sequence.
pub fn reassemble<I>(chunks: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = Chunk>,
{
    reassemble_with_chunk_size(chunks, CHUNK_SIZE)
}

pub fn reassemble_with_chunk_size<I>(chunks: I, chunk_size: usize) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut reassembler = Reassembler::with_chunk_size(chunk_size);
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(reassembler.push(&chunk)?);
    }
    reassembler.finish()?;
    Ok(out)
}
