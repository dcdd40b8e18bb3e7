//! Per-recipient FMK wrapping: ECDH-derived KEK, XOR wrap
//!
//! ```text
//! shared        = ECDH(sender_secret, recipient_public) = ECDH(recipient_secret, sender_public)
//! KEK           = HKDF-SHA256(salt="CDOC20kekpremaster", ikm=shared,
//!                             info="CDOC20kek" || "XOR" || recipient_pub || sender_pub)
//! encrypted_fmk = FMK XOR KEK
//! ```
//!
//! The XOR wrap is a one-time pad keyed by the KEK, so a KEK must never wrap
//! two different FMKs. `wrap_fmk_ephemeral` guarantees that by drawing a new
//! sender key for every recipient of every document.

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::ec::{agree, encode_public_key, EcKeyPair, PublicKey};
use crate::keys::FileMasterKey;
use crate::FMK_LEN;

/// Name of the only implemented FMK encryption method, bound into the KEK.
pub const FMK_ENCRYPTION_METHOD_XOR: &str = "XOR";

const KEK_PREMASTER_SALT: &[u8] = b"CDOC20kekpremaster";
const KEK_INFO: &[u8] = b"CDOC20kek";

/// One recipient's wrapped FMK together with the keys needed to unwrap it.
#[derive(Clone, PartialEq, Eq)]
pub struct EccRecipient {
    recipient_public_key: PublicKey,
    sender_public_key: PublicKey,
    encrypted_fmk: [u8; FMK_LEN],
}

impl EccRecipient {
    pub fn new(
        recipient_public_key: PublicKey,
        sender_public_key: PublicKey,
        encrypted_fmk: [u8; FMK_LEN],
    ) -> Self {
        Self {
            recipient_public_key,
            sender_public_key,
            encrypted_fmk,
        }
    }

    pub fn recipient_public_key(&self) -> &PublicKey {
        &self.recipient_public_key
    }

    pub fn sender_public_key(&self) -> &PublicKey {
        &self.sender_public_key
    }

    pub fn encrypted_fmk(&self) -> &[u8; FMK_LEN] {
        &self.encrypted_fmk
    }

    pub fn is_for(&self, public: &PublicKey) -> bool {
        &self.recipient_public_key == public
    }
}

impl std::fmt::Debug for EccRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EccRecipient")
            .field(
                "recipient_public_key",
                &hex::encode(encode_public_key(&self.recipient_public_key)),
            )
            .field(
                "sender_public_key",
                &hex::encode(encode_public_key(&self.sender_public_key)),
            )
            .field("encrypted_fmk", &hex::encode(self.encrypted_fmk))
            .finish()
    }
}

/// Wrap `fmk` for `recipient` using the sender's key pair.
pub fn wrap_fmk(
    fmk: &FileMasterKey,
    sender: &EcKeyPair,
    recipient: &PublicKey,
) -> Cdoc2Result<EccRecipient> {
    let mut kek = derive_kek(sender, recipient, recipient, sender.public_key())?;
    let encrypted_fmk = xor(fmk.as_bytes(), &kek);
    kek.zeroize();

    tracing::debug!(
        encrypted_fmk = %hex::encode(encrypted_fmk),
        "wrapped FMK for recipient"
    );
    Ok(EccRecipient::new(
        *recipient,
        *sender.public_key(),
        encrypted_fmk,
    ))
}

/// Wrap `fmk` for `recipient` with a freshly generated sender key pair.
pub fn wrap_fmk_ephemeral(fmk: &FileMasterKey, recipient: &PublicKey) -> Cdoc2Result<EccRecipient> {
    let sender = EcKeyPair::generate();
    wrap_fmk(fmk, &sender, recipient)
}

/// Recover the FMK from a record addressed to `recipient`.
pub fn unwrap_fmk(record: &EccRecipient, recipient: &EcKeyPair) -> Cdoc2Result<FileMasterKey> {
    if !record.is_for(recipient.public_key()) {
        return Err(Cdoc2Error::Crypto(
            "recipient record is not addressed to this key pair".into(),
        ));
    }

    let mut kek = derive_kek(
        recipient,
        &record.sender_public_key,
        recipient.public_key(),
        &record.sender_public_key,
    )?;
    let fmk = FileMasterKey::from_bytes(xor(&record.encrypted_fmk, &kek));
    kek.zeroize();
    Ok(fmk)
}

/// KEK for the pair (`own`, `peer`), bound to the record's two public keys.
///
/// `recipient_pub` and `sender_pub` are passed explicitly so both sides feed
/// the HKDF info in the same order regardless of who is computing.
fn derive_kek(
    own: &EcKeyPair,
    peer: &PublicKey,
    recipient_pub: &PublicKey,
    sender_pub: &PublicKey,
) -> Cdoc2Result<[u8; FMK_LEN]> {
    let shared = agree(own.secret_key(), peer);
    let hkdf = Hkdf::<Sha256>::new(Some(KEK_PREMASTER_SALT), shared.as_bytes());

    let recipient_enc = encode_public_key(recipient_pub);
    let sender_enc = encode_public_key(sender_pub);

    let mut kek = [0u8; FMK_LEN];
    hkdf.expand_multi_info(
        &[
            KEK_INFO,
            FMK_ENCRYPTION_METHOD_XOR.as_bytes(),
            &recipient_enc,
            &sender_enc,
        ],
        &mut kek,
    )
    .map_err(|e| Cdoc2Error::Crypto(format!("KEK expand failed: {e}")))?;
    Ok(kek)
}

fn xor(a: &[u8; FMK_LEN], b: &[u8; FMK_LEN]) -> [u8; FMK_LEN] {
    let mut out = [0u8; FMK_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}
