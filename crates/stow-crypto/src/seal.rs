//! Per-chunk sign-then-seal and open-then-verify

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::Signature;

use crate::error::{CryptoError, Result};
use crate::framing::Chunk;
use crate::keys::{AssetKeys, SymmetricKey, VerifyKey};
use crate::nonce::nonce;
use crate::{CHUNK_OVERHEAD, SIGNATURE_SIZE};

const SIGNATURE_CONTEXT: &[u8] = b"stowaway chunk signature v1\0";

/// A sealed chunk ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub index: u64,
    pub is_last: bool,
    pub bytes: Vec<u8>,
}

/// Build the signed message: context || index (8 bytes BE) || is_last || payload
fn signed_message(index: u64, is_last: bool, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 9 + payload.len());
    msg.extend_from_slice(SIGNATURE_CONTEXT);
    msg.extend_from_slice(&index.to_be_bytes());
    msg.push(u8::from(is_last));
    msg.extend_from_slice(payload);
    msg
}

fn cipher_for(key: &SymmetricKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(key.as_bytes().into())
}

/// Seals chunks with one asset's key material.
pub struct ChunkSealer {
    keys: AssetKeys,
    cipher: XChaCha20Poly1305,
}

impl ChunkSealer {
    pub fn new(keys: AssetKeys) -> Self {
        let cipher = cipher_for(keys.encrypt_key());
        Self { keys, cipher }
    }

    pub fn keys(&self) -> &AssetKeys {
        &self.keys
    }

    pub fn seal(&self, chunk: &Chunk) -> Result<SealedChunk> {
        let signature = self
            .keys
            .signing()
            .sign(&signed_message(chunk.index, chunk.is_last, &chunk.payload));

        let mut buf = Vec::with_capacity(chunk.payload.len() + CHUNK_OVERHEAD);
        buf.extend_from_slice(&signature.to_bytes());
        buf.extend_from_slice(&chunk.payload);

        let n = nonce(chunk.index, chunk.is_last);
        self.cipher
            .encrypt_in_place(XNonce::from_slice(&n), b"", &mut buf)
            .map_err(|e| CryptoError::Cipher(format!("sealing chunk {}: {e}", chunk.index)))?;

        Ok(SealedChunk {
            index: chunk.index,
            is_last: chunk.is_last,
            bytes: buf,
        })
    }
}

/// Opens and verifies sealed chunks.
pub struct ChunkOpener {
    cipher: XChaCha20Poly1305,
    verify_key: VerifyKey,
}

impl ChunkOpener {
    pub fn new(key: &SymmetricKey, verify_key: VerifyKey) -> Self {
        Self {
            cipher: cipher_for(key),
            verify_key,
        }
    }

    /// Open the chunk expected at `index`.
    ///
    /// The reader cannot know which chunk is terminal, so the non-terminal
    /// nonce is tried first and the terminal nonce second. Returns the
    /// payload and the terminal flag it authenticated under.
    ///
    /// When neither variant opens, the neighbouring positions are probed so
    /// a swapped chunk reports [`CryptoError::Order`] rather than a generic
    /// integrity failure.
    pub fn open(&self, index: u64, sealed: &[u8]) -> Result<(Vec<u8>, bool)> {
        if let Some(opened) = self.open_at(index, sealed) {
            return Ok(opened);
        }

        let neighbours = [index.checked_add(1), index.checked_sub(1)];
        for found in neighbours.into_iter().flatten() {
            if self.open_at(found, sealed).is_some() {
                return Err(CryptoError::Order {
                    expected: index,
                    found,
                });
            }
        }

        Err(CryptoError::Integrity { index })
    }

    fn open_at(&self, index: u64, sealed: &[u8]) -> Option<(Vec<u8>, bool)> {
        [false, true]
            .into_iter()
            .find_map(|is_last| self.try_open(index, is_last, sealed).map(|p| (p, is_last)))
    }

    fn try_open(&self, index: u64, is_last: bool, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < CHUNK_OVERHEAD {
            return None;
        }

        let mut buf = sealed.to_vec();
        let n = nonce(index, is_last);
        self.cipher
            .decrypt_in_place(XNonce::from_slice(&n), b"", &mut buf)
            .ok()?;

        let payload = buf.split_off(SIGNATURE_SIZE);
        let sig_bytes: [u8; SIGNATURE_SIZE] = buf.as_slice().try_into().ok()?;
        let signature = Signature::from_bytes(&sig_bytes);

        self.verify_key
            .verify(&signed_message(index, is_last, &payload), &signature)
            .then_some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u64, payload: &[u8], is_last: bool) -> Chunk {
        Chunk {
            index,
            payload: payload.to_vec(),
            is_last,
        }
    }

    fn sealer_and_opener() -> (ChunkSealer, ChunkOpener) {
        let keys = AssetKeys::generate();
        let opener = ChunkOpener::new(keys.encrypt_key(), keys.verify_key());
        (ChunkSealer::new(keys), opener)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (sealer, opener) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(0, b"hello, sealed world!", true)).unwrap();

        let (payload, is_last) = opener.open(0, &sealed.bytes).unwrap();
        assert_eq!(payload, b"hello, sealed world!");
        assert!(is_last);
    }

    #[test]
    fn test_sealed_size() {
        let (sealer, _) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(0, &[0u8; 1000], true)).unwrap();
        // signature (64) + payload (1000) + tag (16)
        assert_eq!(sealed.bytes.len(), 1000 + CHUNK_OVERHEAD);
    }

    #[test]
    fn test_non_terminal_flag_recovered() {
        let (sealer, opener) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(5, b"middle", false)).unwrap();
        let (_, is_last) = opener.open(5, &sealed.bytes).unwrap();
        assert!(!is_last);
    }

    #[test]
    fn test_sealing_is_deterministic() {
        let keys = AssetKeys::generate();
        let a = ChunkSealer::new(keys.clone());
        let b = ChunkSealer::new(keys);
        let c = chunk(7, b"same bytes", false);
        assert_eq!(a.seal(&c).unwrap(), b.seal(&c).unwrap());
    }

    #[test]
    fn test_open_wrong_key() {
        let (sealer, _) = sealer_and_opener();
        let (_, other) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(0, b"secret", true)).unwrap();
        let err = other.open(0, &sealed.bytes).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity { index: 0 }));
    }

    #[test]
    fn test_open_wrong_verify_key() {
        let keys = AssetKeys::generate();
        let stranger = AssetKeys::generate();
        let opener = ChunkOpener::new(keys.encrypt_key(), stranger.verify_key());
        let sealed = ChunkSealer::new(keys).seal(&chunk(0, b"secret", true)).unwrap();

        let err = opener.open(0, &sealed.bytes).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity { index: 0 }));
    }

    #[test]
    fn test_open_tampered() {
        let (sealer, opener) = sealer_and_opener();
        let mut sealed = sealer.seal(&chunk(0, b"secret data", true)).unwrap();
        sealed.bytes[3] ^= 0x01;
        let err = opener.open(0, &sealed.bytes).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity { index: 0 }));
    }

    #[test]
    fn test_open_at_neighbour_reports_order() {
        let (sealer, opener) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(3, b"misplaced", false)).unwrap();
        let err = opener.open(2, &sealed.bytes).unwrap_err();
        assert!(
            matches!(err, CryptoError::Order { expected: 2, found: 3 }),
            "{err}"
        );
    }

    #[test]
    fn test_open_far_position_reports_integrity() {
        let (sealer, opener) = sealer_and_opener();
        let sealed = sealer.seal(&chunk(9, b"far away", false)).unwrap();
        let err = opener.open(2, &sealed.bytes).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity { index: 2 }), "{err}");
    }

    #[test]
    fn test_open_too_short() {
        let (_, opener) = sealer_and_opener();
        let err = opener.open(0, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, CryptoError::Integrity { index: 0 }));
    }
}
