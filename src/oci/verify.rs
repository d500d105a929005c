//! Gadget image signature verification.
//!
//! Images are signed by build tooling with an Ed25519 key: the signature is
//! computed over the manifest digest and carried in the
//! [`SIGNATURE_ANNOTATION`] manifest annotation, base64-encoded. Verifiers
//! configure the raw 32-byte public key, also base64-encoded.

use crate::constants::SIGNATURE_ANNOTATION;
use crate::error::{Error, Result};
use crate::oci::ImageManifest;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};

/// Verifies the signature annotation of `manifest` against `public_key_b64`.
pub fn verify_manifest(
    manifest: &ImageManifest,
    reference: &str,
    public_key_b64: &str,
) -> Result<()> {
    let unverified = |reason: String| Error::ImageUnverified {
        reference: reference.to_string(),
        reason,
    };

    let key_bytes = BASE64
        .decode(public_key_b64.trim())
        .map_err(|e| unverified(format!("invalid public key encoding: {}", e)))?;

    let sig_b64 = manifest
        .annotations
        .get(SIGNATURE_ANNOTATION)
        .ok_or_else(|| unverified("image is not signed".to_string()))?;
    let signature = BASE64
        .decode(sig_b64)
        .map_err(|e| unverified(format!("invalid signature encoding: {}", e)))?;

    UnparsedPublicKey::new(&ED25519, key_bytes)
        .verify(manifest.digest.as_bytes(), &signature)
        .map_err(|_| unverified("signature does not match public key".to_string()))
}

/// A signing key for gadget build tooling.
///
/// The runtime only verifies; signing lives here so publishing tools and
/// tests produce annotations the verifier accepts.
pub struct SigningKey {
    keypair: Ed25519KeyPair,
}

impl SigningKey {
    /// Generates a fresh Ed25519 key.
    pub fn generate() -> Result<Self> {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::InvalidParam {
                key: "public-key".to_string(),
                reason: "system RNG unavailable".to_string(),
            })?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Loads a key from PKCS#8 bytes.
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|e| Error::InvalidParam {
            key: "public-key".to_string(),
            reason: format!("invalid signing key: {}", e),
        })?;
        Ok(Self { keypair })
    }

    /// The base64 public key to configure on verifiers.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.keypair.public_key().as_ref())
    }

    /// Signs a manifest in place, setting the signature annotation.
    pub fn sign_manifest(&self, manifest: &mut ImageManifest) {
        let signature = self.keypair.sign(manifest.digest.as_bytes());
        manifest.annotations.insert(
            SIGNATURE_ANNOTATION.to_string(),
            BASE64.encode(signature.as_ref()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ImageManifest {
        ImageManifest {
            digest: "sha256:0123abcd".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn signed_manifest_verifies() {
        let key = SigningKey::generate().unwrap();
        let mut m = manifest();
        key.sign_manifest(&mut m);
        verify_manifest(&m, "ghcr.io/gadget/dns:latest", &key.public_key_b64()).unwrap();
    }

    #[test]
    fn unsigned_manifest_is_rejected() {
        let key = SigningKey::generate().unwrap();
        let err = verify_manifest(&manifest(), "img", &key.public_key_b64()).unwrap_err();
        assert!(matches!(err, Error::ImageUnverified { .. }));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = SigningKey::generate().unwrap();
        let other = SigningKey::generate().unwrap();
        let mut m = manifest();
        signer.sign_manifest(&mut m);

        let err = verify_manifest(&m, "img", &other.public_key_b64()).unwrap_err();
        assert!(matches!(err, Error::ImageUnverified { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Image);
    }

    #[test]
    fn tampered_digest_is_rejected() {
        let key = SigningKey::generate().unwrap();
        let mut m = manifest();
        key.sign_manifest(&mut m);
        m.digest = "sha256:ffff".to_string();

        assert!(verify_manifest(&m, "img", &key.public_key_b64()).is_err());
    }
}
