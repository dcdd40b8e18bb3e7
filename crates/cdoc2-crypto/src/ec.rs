//! P-384 (secp384r1) key pairs, public key encoding, and static ECDH
//!
//! Public keys travel in the header in TLS / SEC1 uncompressed form:
//! ```text
//! [0x04][48 bytes: X][48 bytes: Y]   (97 bytes)
//! ```
//! Decoding validates the point against the curve equation; the point at
//! infinity (SEC1 `0x00`) and every off-curve point are rejected.

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use p384::ecdh;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey};
use zeroize::Zeroize;

pub use p384::{PublicKey, SecretKey};

use crate::P384_PUBLIC_KEY_LEN;

const SHARED_SECRET_LEN: usize = 48;

/// A recipient (or sender) key pair usable for ECDH.
#[derive(Clone)]
pub struct EcKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EcKeyPair {
    /// Generate a random key pair (used for per-recipient ephemeral sender keys).
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Load a P-384 private key from PEM (SEC1 `EC PRIVATE KEY` or PKCS#8).
    pub fn from_pem(pem: &str) -> Cdoc2Result<Self> {
        let secret = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(pem)
                .map_err(|e| Cdoc2Error::Crypto(format!("invalid SEC1 EC private key: {e}")))?
        } else {
            SecretKey::from_pkcs8_pem(pem)
                .map_err(|e| Cdoc2Error::Crypto(format!("invalid PKCS#8 private key: {e}")))?
        };
        Ok(Self::from_secret_key(secret))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("public", &hex::encode(encode_public_key(&self.public)))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Load a P-384 public key from a PEM `PUBLIC KEY` (SPKI) block.
pub fn public_key_from_pem(pem: &str) -> Cdoc2Result<PublicKey> {
    PublicKey::from_public_key_pem(pem)
        .map_err(|e| Cdoc2Error::Crypto(format!("invalid P-384 public key PEM: {e}")))
}

/// Encode a public key as `0x04 || X || Y`.
pub fn encode_public_key(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(false).as_bytes().to_vec()
}

/// Decode and validate a TLS-encoded P-384 public key.
pub fn decode_public_key(bytes: &[u8]) -> Cdoc2Result<PublicKey> {
    if bytes.len() != P384_PUBLIC_KEY_LEN {
        return Err(Cdoc2Error::Crypto(format!(
            "invalid EC public key length: {} bytes (expected {P384_PUBLIC_KEY_LEN})",
            bytes.len()
        )));
    }
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| Cdoc2Error::Crypto("EC public key is not a valid secp384r1 point".into()))
}

/// Raw ECDH shared secret (the x-coordinate). Zeroized on drop.
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_LEN],
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Static Diffie-Hellman. `peer` is already curve-validated by its type.
pub fn agree(secret: &SecretKey, peer: &PublicKey) -> SharedSecret {
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let mut bytes = [0u8; SHARED_SECRET_LEN];
    bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
    SharedSecret { bytes }
}

/// ECDH against a peer key that still has to be decoded and validated.
pub fn agree_encoded(secret: &SecretKey, peer: &[u8]) -> Cdoc2Result<SharedSecret> {
    let peer = decode_public_key(peer)?;
    Ok(agree(secret, &peer))
}
