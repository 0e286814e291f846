//! Request-signing capability
//!
//! Storage protocols authenticate requests with a signature over a canonical
//! description of the request. The signer is injected per transfer and is
//! unrelated to the per-chunk ed25519 signatures of the codec.

use anyhow::Result;

use stow_core::Destination;

pub trait RequestSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

impl<F> RequestSigner for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self(payload)
    }
}

/// BLAKE3 keyed-hash signer with a 32-byte shared secret.
pub struct KeyedSigner {
    secret: [u8; 32],
}

impl KeyedSigner {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Derive the signing secret from an access-key pair.
    pub fn from_credentials(access_key_id: &str, secret_access_key: &str) -> Self {
        let mut material = Vec::with_capacity(access_key_id.len() + secret_access_key.len() + 1);
        material.extend_from_slice(access_key_id.as_bytes());
        material.push(b':');
        material.extend_from_slice(secret_access_key.as_bytes());
        Self::new(blake3::derive_key("stowaway request signer v1", &material))
    }
}

impl RequestSigner for KeyedSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(blake3::keyed_hash(&self.secret, payload).as_bytes().to_vec())
    }
}

impl std::fmt::Debug for KeyedSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedSigner")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Canonical string signed for one storage request.
pub fn canonical_request(method: &str, dest: &Destination, detail: &str) -> Vec<u8> {
    format!("{method}\n{}\n{}\n{detail}", dest.bucket, dest.object_key).into_bytes()
}

/// Sign a request, attaching the operation to any failure.
pub fn sign_request(
    signer: &dyn RequestSigner,
    method: &str,
    dest: &Destination,
    detail: &str,
) -> Result<Vec<u8>> {
    signer
        .sign(&canonical_request(method, dest, detail))
        .map_err(|e| anyhow::anyhow!("signing {method} {dest}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_signer_deterministic() {
        let s = KeyedSigner::new([3u8; 32]);
        assert_eq!(s.sign(b"payload").unwrap(), s.sign(b"payload").unwrap());
        assert_ne!(s.sign(b"payload").unwrap(), s.sign(b"payload2").unwrap());
    }

    #[test]
    fn test_keyed_signer_depends_on_secret() {
        let a = KeyedSigner::from_credentials("AKID", "secret-a");
        let b = KeyedSigner::from_credentials("AKID", "secret-b");
        assert_ne!(a.sign(b"x").unwrap(), b.sign(b"x").unwrap());
    }

    #[test]
    fn test_closure_signer() {
        let signer = |payload: &[u8]| -> Result<Vec<u8>> { Ok(payload.to_vec()) };
        let dest = Destination::new("b", "k");
        let sig = sign_request(&signer, "PUT", &dest, "part=1").unwrap();
        assert_eq!(sig, b"PUT\nb\nk\npart=1");
    }

    #[test]
    fn test_failing_signer_names_request() {
        let signer = |_: &[u8]| -> Result<Vec<u8>> { anyhow::bail!("token expired") };
        let dest = Destination::new("b", "k");
        let err = sign_request(&signer, "GET", &dest, "").unwrap_err();
        assert!(err.to_string().contains("GET b/k"), "{err}");
        assert!(err.to_string().contains("token expired"), "{err}");
    }
}
