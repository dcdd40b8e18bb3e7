//! Key hierarchy: FMK generation and the two FMK-derived symmetric keys

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{CEK_LEN, FMK_LEN, HHK_LEN};

const FMK_SALT: &[u8] = b"CDOC20salt";
const FMK_INFO: &[u8] = b"CDOC20";
const HHK_INFO: &[u8] = b"CDOC20hmac";
const CEK_INFO: &[u8] = b"CDOC20cek";

/// Fixed-size secret that zeroizes on drop and never prints its bytes.
macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name {
            bytes: [u8; $len],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// The per-document File Master Key. Only ever lives in memory.
    FileMasterKey,
    FMK_LEN
);

secret_key!(
    /// Key for HMAC-SHA256 over the serialized header.
    HeaderHmacKey,
    HHK_LEN
);

secret_key!(
    /// Key for the payload stream cipher.
    ContentEncryptionKey,
    CEK_LEN
);

impl FileMasterKey {
    /// Build an FMK from a slice; anything other than 32 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Cdoc2Result<Self> {
        let arr: [u8; FMK_LEN] = bytes.try_into().map_err(|_| {
            Cdoc2Error::Crypto(format!(
                "invalid FMK length: {} bytes (expected {FMK_LEN})",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }
}

/// Generate a fresh FMK: HKDF-Extract over 256 random bits, expanded with "CDOC20".
pub fn generate_fmk() -> Cdoc2Result<FileMasterKey> {
    let mut ikm = [0u8; FMK_LEN];
    rand::thread_rng().fill_bytes(&mut ikm);
    let hkdf = Hkdf::<Sha256>::new(Some(FMK_SALT), &ikm);
    ikm.zeroize();

    let mut okm = [0u8; FMK_LEN];
    hkdf.expand(FMK_INFO, &mut okm)
        .map_err(|e| Cdoc2Error::Crypto(format!("FMK expand failed: {e}")))?;
    Ok(FileMasterKey::from_bytes(okm))
}

/// Derive the header HMAC key from the FMK.
pub fn derive_header_hmac_key(fmk: &FileMasterKey) -> Cdoc2Result<HeaderHmacKey> {
    hkdf_expand(fmk.as_bytes(), &[HHK_INFO]).map(HeaderHmacKey::from_bytes)
}

/// Derive the content encryption key from the FMK.
pub fn derive_content_encryption_key(fmk: &FileMasterKey) -> Cdoc2Result<ContentEncryptionKey> {
    hkdf_expand(fmk.as_bytes(), &[CEK_INFO]).map(ContentEncryptionKey::from_bytes)
}

/// HKDF-Expand (SHA-256) treating `prk` as an already-extracted key.
pub(crate) fn hkdf_expand(prk: &[u8], info: &[&[u8]]) -> Cdoc2Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|e| Cdoc2Error::Crypto(format!("HKDF PRK rejected: {e}")))?;
    let mut okm = [0u8; 32];
    hkdf.expand_multi_info(info, &mut okm)
        .map_err(|e| Cdoc2Error::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
