//! cdoc2-crypto: cryptographic building blocks for the CDOC2 envelope
//!
//! Key hierarchy:
//! ```text
//! File Master Key (256-bit, HKDF-Extract("CDOC20salt", random) → Expand("CDOC20"))
//!   ├── Header HMAC Key      HKDF-Expand(FMK, "CDOC20hmac")  → HMAC-SHA256 over header bytes
//!   ├── Content Encryption   HKDF-Expand(FMK, "CDOC20cek")   → STREAM ChaCha20-Poly1305 payload
//!   └── per recipient:  encrypted_fmk = FMK XOR KEK
//!         KEK = HKDF-Expand(HKDF-Extract("CDOC20kekpremaster", ECDH_P384),
//!                           "CDOC20kek" || "XOR" || recipient_pub || sender_pub)
//! ```

pub mod ec;
pub mod keys;
pub mod mac;
pub mod recipient;
pub mod stream;

pub use ec::{
    agree, decode_public_key, encode_public_key, public_key_from_pem, EcKeyPair, PublicKey,
    SecretKey, SharedSecret,
};
pub use mac::{header_hmac, verify_header_hmac};
pub use keys::{
    derive_content_encryption_key, derive_header_hmac_key, generate_fmk, ContentEncryptionKey,
    FileMasterKey, HeaderHmacKey,
};
pub use recipient::{unwrap_fmk, wrap_fmk, wrap_fmk_ephemeral, EccRecipient};
pub use stream::{payload_aad, DecryptingReader, EncryptingWriter};

/// Size of the file master key in bytes (256-bit)
pub const FMK_LEN: usize = 32;

/// Size of the content encryption key in bytes
pub const CEK_LEN: usize = 32;

/// Size of the header HMAC key and of the HMAC-SHA256 tag
pub const HHK_LEN: usize = 32;

/// Length of a TLS-encoded (SEC1 uncompressed) P-384 public key
pub const P384_PUBLIC_KEY_LEN: usize = 97;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
