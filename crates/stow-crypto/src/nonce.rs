//! Position-derived nonces
//!
//! ```text
//! [15 bytes: domain tag][1 byte: is_last][8 bytes: chunk index, big-endian]
//! ```
//!
//! Injective in `(index, is_last)`, so a nonce never repeats under one key.
//! Keys are never shared between assets, which makes the fixed tag safe.

use crate::NONCE_SIZE;

const NONCE_DOMAIN: &[u8; 15] = b"stowaway-chunk:";

pub fn nonce(index: u64, is_last: bool) -> [u8; NONCE_SIZE] {
    let mut out = [0u8; NONCE_SIZE];
    out[..15].copy_from_slice(NONCE_DOMAIN);
    out[15] = u8::from(is_last);
    out[16..].copy_from_slice(&index.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_nonce_is_deterministic() {
        assert_eq!(nonce(42, false), nonce(42, false));
    }

    #[test]
    fn test_terminal_flag_changes_nonce() {
        assert_ne!(nonce(3, false), nonce(3, true));
    }

    #[test]
    fn test_nonces_unique_across_positions() {
        let mut seen = HashSet::new();
        for index in [0u64, 1, 2, 255, 256, u32::MAX as u64, u64::MAX] {
            for is_last in [false, true] {
                assert!(seen.insert(nonce(index, is_last)), "collision at {index}/{is_last}");
            }
        }
    }

    #[test]
    fn test_nonce_layout() {
        let n = nonce(0x0102, true);
        assert_eq!(&n[..15], NONCE_DOMAIN);
        assert_eq!(n[15], 1);
        assert_eq!(&n[16..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }
}
