//! Streaming sign-encrypter
//!
//! Key material is generated on every [`SignEncrypter::encrypt`] call rather
//! than at construction, so one long-lived encrypter never seals two
//! plaintexts under the same keys.

use futures::Stream;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::{CryptoError, Result};
use crate::framing::{self, ChunkSplitter};
use crate::keys::{AssetKeys, SymmetricKey, VerifyKey};
use crate::seal::{ChunkSealer, SealedChunk};

#[derive(Debug, Default)]
pub struct SignEncrypter {
    keys: Option<AssetKeys>,
}

impl SignEncrypter {
    /// Construct an encrypter. No keys exist until the first `encrypt`.
    pub fn new() -> Self {
        Self { keys: None }
    }

    pub fn encrypted_len(&self, plaintext_len: u64) -> u64 {
        framing::encrypted_len(plaintext_len)
    }

    /// Start sealing `source` under freshly generated key material.
    pub fn encrypt<R: AsyncRead + Unpin>(&mut self, source: R) -> EncryptStream<R> {
        let keys = AssetKeys::generate();
        debug!(verify_key = ?keys.verify_key(), "generated asset keys");
        self.start(source, keys)
    }

    /// Re-seal `source` under key material from an earlier `encrypt`.
    ///
    /// Only for re-deriving the exact ciphertext of an interrupted upload:
    /// given the same plaintext, the output is byte-identical to the first
    /// attempt.
    pub fn resume<R: AsyncRead + Unpin>(&mut self, source: R, keys: AssetKeys) -> EncryptStream<R> {
        self.start(source, keys)
    }

    fn start<R: AsyncRead + Unpin>(&mut self, source: R, keys: AssetKeys) -> EncryptStream<R> {
        self.keys = Some(keys.clone());
        EncryptStream {
            splitter: ChunkSplitter::new(source),
            sealer: ChunkSealer::new(keys),
        }
    }

    pub fn keys(&self) -> Result<&AssetKeys> {
        self.keys.as_ref().ok_or(CryptoError::KeysUnavailable)
    }

    pub fn encrypt_key(&self) -> Result<&SymmetricKey> {
        self.keys().map(AssetKeys::encrypt_key)
    }

    pub fn verify_key(&self) -> Result<VerifyKey> {
        self.keys().map(AssetKeys::verify_key)
    }
}

/// Lazy sequence of sealed chunks. Holds at most one chunk in memory.
pub struct EncryptStream<R> {
    splitter: ChunkSplitter<R>,
    sealer: ChunkSealer,
}

impl<R: AsyncRead + Unpin> EncryptStream<R> {
    pub async fn next_sealed(&mut self) -> Result<Option<SealedChunk>> {
        match self.splitter.next_chunk().await? {
            Some(chunk) => self.sealer.seal(&chunk).map(Some),
            None => Ok(None),
        }
    }

    pub fn keys(&self) -> &AssetKeys {
        self.sealer.keys()
    }

    /// Drain the stream into one buffer. Intended for small payloads and tests.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(sealed) = self.next_sealed().await? {
            out.extend_from_slice(&sealed.bytes);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<SealedChunk>> {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok(stream.next_sealed().await?.map(|sealed| (sealed, stream)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;
    use futures::TryStreamExt;

    #[test]
    fn test_keys_unavailable_before_encrypt() {
        let e = SignEncrypter::new();
        assert!(matches!(e.encrypt_key(), Err(CryptoError::KeysUnavailable)));
        assert!(matches!(e.verify_key(), Err(CryptoError::KeysUnavailable)));
    }

    #[test]
    fn test_encrypted_len() {
        let e = SignEncrypter::new();
        assert_eq!(e.encrypted_len(100), 180);
        assert_eq!(e.encrypted_len(50 * 1024 * 1024), 52_432_880);
    }

    #[tokio::test]
    async fn test_encrypt_changes_plaintext() {
        let mut e = SignEncrypter::new();
        let pt = b"plain text";
        let ct = e.encrypt(&pt[..]).read_to_end().await.unwrap();
        assert_eq!(ct.len() as u64, e.encrypted_len(pt.len() as u64));
        assert!(!ct.windows(pt.len()).any(|w| w == pt));
    }

    #[tokio::test]
    async fn test_every_encrypt_rotates_keys() {
        let mut e = SignEncrypter::new();
        let pt = b"plain text";

        let ct1 = e.encrypt(&pt[..]).read_to_end().await.unwrap();
        let key1 = *e.encrypt_key().unwrap().as_bytes();
        let vk1 = e.verify_key().unwrap();

        let ct2 = e.encrypt(&pt[..]).read_to_end().await.unwrap();
        assert_ne!(ct1, ct2, "second encrypt must not reproduce the first");
        assert_ne!(&key1, e.encrypt_key().unwrap().as_bytes(), "encrypt key reused");
        assert_ne!(vk1, e.verify_key().unwrap(), "verify key reused");
    }

    #[tokio::test]
    async fn test_resume_reproduces_ciphertext() {
        let data: Vec<u8> = (0..(2 * CHUNK_SIZE + 17)).map(|i| (i % 251) as u8).collect();
        let mut e = SignEncrypter::new();
        let first = e.encrypt(data.as_slice()).read_to_end().await.unwrap();
        let keys = e.keys().unwrap().clone();

        let second = e.resume(data.as_slice(), keys).read_to_end().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stream_yields_one_item_per_chunk() {
        let data = vec![1u8; CHUNK_SIZE + 5];
        let mut e = SignEncrypter::new();
        let sealed: Vec<SealedChunk> = e
            .encrypt(data.as_slice())
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].index, 0);
        assert!(!sealed[0].is_last);
        assert!(sealed[1].is_last);
        assert_eq!(sealed[1].bytes.len(), 5 + crate::CHUNK_OVERHEAD);
    }
}
