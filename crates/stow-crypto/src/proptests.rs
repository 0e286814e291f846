//! Property tests for the sign-encrypt codec.
//!
//! Uses a small current-thread runtime per case; chunk-boundary behaviour is
//! covered by lengths straddling CHUNK_SIZE.

use proptest::prelude::*;

use crate::decrypter::SignDecrypter;
use crate::encrypter::SignEncrypter;
use crate::error::CryptoError;
use crate::framing::{chunk_count, encrypted_len, plaintext_len};
use crate::{CHUNK_OVERHEAD, CHUNK_SIZE};

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
        .block_on(fut)
}

fn around_chunk_boundary() -> impl Strategy<Value = usize> {
    prop_oneof![
        0usize..2048,
        (CHUNK_SIZE - 64)..(CHUNK_SIZE + 64),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn encrypted_len_formula(n in 0u64..(1u64 << 40)) {
        let expected = n + (n / CHUNK_SIZE as u64 + 1) * CHUNK_OVERHEAD as u64;
        prop_assert_eq!(encrypted_len(n), expected);
        prop_assert_eq!(plaintext_len(encrypted_len(n)), Some(n));
        prop_assert_eq!(chunk_count(n), n / CHUNK_SIZE as u64 + 1);
    }

    #[test]
    fn roundtrip(len in around_chunk_boundary(), seed in any::<u8>()) {
        let pt: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(seed | 1)).collect();
        let (ct, out) = block_on(async {
            let mut e = SignEncrypter::new();
            let ct = e.encrypt(pt.as_slice()).read_to_end().await.unwrap();
            let out = SignDecrypter::new()
                .decrypt(ct.as_slice(), e.encrypt_key().unwrap(), &e.verify_key().unwrap())
                .read_to_end()
                .await
                .unwrap();
            (ct, out)
        });
        prop_assert_eq!(ct.len() as u64, encrypted_len(len as u64));
        prop_assert_eq!(out, pt);
    }

    #[test]
    fn any_bit_flip_is_detected(len in 0usize..512, pos in any::<prop::sample::Index>(), bit in 0u8..8) {
        let pt = vec![0x5Au8; len];
        let result = block_on(async {
            let mut e = SignEncrypter::new();
            let mut ct = e.encrypt(pt.as_slice()).read_to_end().await.unwrap();
            let at = pos.index(ct.len());
            ct[at] ^= 1 << bit;
            SignDecrypter::new()
                .decrypt(ct.as_slice(), e.encrypt_key().unwrap(), &e.verify_key().unwrap())
                .read_to_end()
                .await
        });
        prop_assert!(matches!(result, Err(CryptoError::Integrity { index: 0 })), "expected Integrity error at index 0");
    }
}
