//! Header codec: recipient records and the payload method tag
//!
//! The header is a protobuf message. Recipient details are a tagged union:
//! `details_type` names the variant and `details` holds that variant's own
//! encoded message, so a reader that does not know a variant can still carry
//! it through unchanged.
//!
//! ```text
//! Header {
//!   1: repeated RecipientRecord
//!        1: details_type            (NONE | ECC_PUBLIC_KEY | KEY_SERVER | future)
//!        2: details                 (encoded EccPublicKeyDetails / KeyServerDetails / opaque)
//!        3: encrypted_fmk           (32 bytes)
//!        4: fmk_encryption_method   (XOR)
//!   2: payload_encryption_method    (CHACHA20POLY1305)
//! }
//! ```

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use cdoc2_crypto::{decode_public_key, encode_public_key, EccRecipient, PublicKey, FMK_LEN};
use prost::Message;

/// Encoded size of the smallest well-formed header: no recipients, only the
/// payload method field (one tag byte, one varint byte).
pub const MIN_HEADER_LEN: usize = 2;

/// Wire schema. Field numbers are part of the format and must not change.
pub mod wire {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Header {
        #[prost(message, repeated, tag = "1")]
        pub recipients: Vec<RecipientRecord>,
        #[prost(enumeration = "PayloadEncryptionMethod", tag = "2")]
        pub payload_encryption_method: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RecipientRecord {
        #[prost(enumeration = "Details", tag = "1")]
        pub details_type: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub details: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub encrypted_fmk: Vec<u8>,
        #[prost(enumeration = "FmkEncryptionMethod", tag = "4")]
        pub fmk_encryption_method: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EccPublicKeyDetails {
        #[prost(enumeration = "EllipticCurve", tag = "1")]
        pub curve: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub recipient_public_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub sender_public_key: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyServerDetails {
        #[prost(bytes = "vec", tag = "1")]
        pub recipient_public_key: Vec<u8>,
        #[prost(string, tag = "2")]
        pub key_server_id: String,
        #[prost(string, tag = "3")]
        pub transaction_id: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum PayloadEncryptionMethod {
        NotUsed = 0,
        Chacha20Poly1305 = 1,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum FmkEncryptionMethod {
        NotUsed = 0,
        Xor = 1,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Details {
        None = 0,
        EccPublicKey = 1,
        KeyServer = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum EllipticCurve {
        Unknown = 0,
        Secp384r1 = 1,
    }
}

pub use wire::PayloadEncryptionMethod;

/// A recipient whose FMK is held by a key server. Recognised but not
/// decryptable locally.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyServerRecipient {
    pub recipient_public_key: PublicKey,
    pub key_server_id: String,
    pub transaction_id: String,
    pub encrypted_fmk: [u8; FMK_LEN],
}

/// A record with a details type this reader does not know, kept byte-for-byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueRecipient {
    pub details_type: i32,
    pub details: Vec<u8>,
    pub encrypted_fmk: [u8; FMK_LEN],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    Ecc(EccRecipient),
    KeyServer(KeyServerRecipient),
    Unknown(OpaqueRecipient),
}

impl Recipient {
    /// Short name of the details variant, for logs and listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Recipient::Ecc(_) => "ecc_public_key",
            Recipient::KeyServer(_) => "key_server",
            Recipient::Unknown(_) => "unknown",
        }
    }

    pub fn recipient_public_key(&self) -> Option<&PublicKey> {
        match self {
            Recipient::Ecc(r) => Some(r.recipient_public_key()),
            Recipient::KeyServer(r) => Some(&r.recipient_public_key),
            Recipient::Unknown(_) => None,
        }
    }

    pub fn encrypted_fmk(&self) -> &[u8; FMK_LEN] {
        match self {
            Recipient::Ecc(r) => r.encrypted_fmk(),
            Recipient::KeyServer(r) => &r.encrypted_fmk,
            Recipient::Unknown(r) => &r.encrypted_fmk,
        }
    }
}

impl std::fmt::Debug for KeyServerRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyServerRecipient")
            .field(
                "recipient_public_key",
                &hex::encode(encode_public_key(&self.recipient_public_key)),
            )
            .field("key_server_id", &self.key_server_id)
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

/// Decoded header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub recipients: Vec<Recipient>,
    pub payload_method: PayloadEncryptionMethod,
}

impl Header {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            payload_method: PayloadEncryptionMethod::Chacha20Poly1305,
        }
    }

    /// Deterministic encoding; record order is preserved.
    pub fn serialize(&self) -> Vec<u8> {
        let msg = wire::Header {
            recipients: self.recipients.iter().map(record_to_wire).collect(),
            payload_encryption_method: self.payload_method as i32,
        };
        msg.encode_to_vec()
    }

    pub fn deserialize(bytes: &[u8]) -> Cdoc2Result<Self> {
        if bytes.len() < MIN_HEADER_LEN {
            return Err(parse(format!(
                "header too short: {} bytes (minimum {MIN_HEADER_LEN})",
                bytes.len()
            )));
        }

        let msg = wire::Header::decode(bytes)
            .map_err(|e| parse(format!("header is not a valid message: {e}")))?;

        let payload_method = match PayloadEncryptionMethod::try_from(msg.payload_encryption_method)
        {
            Ok(PayloadEncryptionMethod::Chacha20Poly1305) => {
                PayloadEncryptionMethod::Chacha20Poly1305
            }
            _ => {
                return Err(parse(format!(
                    "unsupported payload encryption method: {}",
                    msg.payload_encryption_method
                )))
            }
        };

        let recipients = msg
            .recipients
            .into_iter()
            .enumerate()
            .map(|(i, record)| record_from_wire(record).map_err(|e| at_record(i, e)))
            .collect::<Cdoc2Result<Vec<_>>>()?;

        tracing::debug!(recipients = recipients.len(), "header parsed");
        Ok(Self {
            recipients,
            payload_method,
        })
    }
}

fn parse(msg: String) -> Cdoc2Error {
    Cdoc2Error::Parse(msg)
}

fn at_record(index: usize, err: Cdoc2Error) -> Cdoc2Error {
    match err {
        Cdoc2Error::Parse(msg) => parse(format!("recipient {index}: {msg}")),
        other => other,
    }
}

fn record_to_wire(recipient: &Recipient) -> wire::RecipientRecord {
    let (details_type, details) = match recipient {
        Recipient::Ecc(r) => (
            wire::Details::EccPublicKey as i32,
            wire::EccPublicKeyDetails {
                curve: wire::EllipticCurve::Secp384r1 as i32,
                recipient_public_key: encode_public_key(r.recipient_public_key()),
                sender_public_key: encode_public_key(r.sender_public_key()),
            }
            .encode_to_vec(),
        ),
        Recipient::KeyServer(r) => (
            wire::Details::KeyServer as i32,
            wire::KeyServerDetails {
                recipient_public_key: encode_public_key(&r.recipient_public_key),
                key_server_id: r.key_server_id.clone(),
                transaction_id: r.transaction_id.clone(),
            }
            .encode_to_vec(),
        ),
        Recipient::Unknown(r) => (r.details_type, r.details.clone()),
    };

    wire::RecipientRecord {
        details_type,
        details,
        encrypted_fmk: recipient.encrypted_fmk().to_vec(),
        fmk_encryption_method: wire::FmkEncryptionMethod::Xor as i32,
    }
}

fn record_from_wire(record: wire::RecipientRecord) -> Cdoc2Result<Recipient> {
    if !matches!(
        wire::FmkEncryptionMethod::try_from(record.fmk_encryption_method),
        Ok(wire::FmkEncryptionMethod::Xor)
    ) {
        return Err(parse(format!(
            "unsupported FMK encryption method: {}",
            record.fmk_encryption_method
        )));
    }

    let encrypted_fmk: [u8; FMK_LEN] = record.encrypted_fmk.as_slice().try_into().map_err(|_| {
        parse(format!(
            "encrypted FMK is {} bytes (expected {FMK_LEN})",
            record.encrypted_fmk.len()
        ))
    })?;

    match wire::Details::try_from(record.details_type) {
        Ok(wire::Details::EccPublicKey) => {
            let details = wire::EccPublicKeyDetails::decode(record.details.as_slice())
                .map_err(|e| parse(format!("invalid ECC details: {e}")))?;
            if !matches!(
                wire::EllipticCurve::try_from(details.curve),
                Ok(wire::EllipticCurve::Secp384r1)
            ) {
                return Err(parse(format!("unsupported curve: {}", details.curve)));
            }
            let recipient = public_key(&details.recipient_public_key, "recipient")?;
            let sender = public_key(&details.sender_public_key, "sender")?;
            Ok(Recipient::Ecc(EccRecipient::new(
                recipient,
                sender,
                encrypted_fmk,
            )))
        }
        Ok(wire::Details::KeyServer) => {
            let details = wire::KeyServerDetails::decode(record.details.as_slice())
                .map_err(|e| parse(format!("invalid key server details: {e}")))?;
            Ok(Recipient::KeyServer(KeyServerRecipient {
                recipient_public_key: public_key(&details.recipient_public_key, "recipient")?,
                key_server_id: details.key_server_id,
                transaction_id: details.transaction_id,
                encrypted_fmk,
            }))
        }
        Ok(wire::Details::None) => Err(parse("recipient record has no details".into())),
        Err(_) => {
            tracing::debug!(
                details_type = record.details_type,
                "carrying unknown recipient details through unchanged"
            );
            Ok(Recipient::Unknown(OpaqueRecipient {
                details_type: record.details_type,
                details: record.details,
                encrypted_fmk,
            }))
        }
    }
}

/// Invalid key encodings in the header are a malformed document, not a crypto failure.
fn public_key(bytes: &[u8], role: &str) -> Cdoc2Result<PublicKey> {
    decode_public_key(bytes).map_err(|e| match e {
        Cdoc2Error::Crypto(msg) => parse(format!("{role} public key: {msg}")),
        other => other,
    })
}
