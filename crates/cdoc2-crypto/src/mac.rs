//! HMAC-SHA256 over the serialized header

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::HeaderHmacKey;
use crate::HHK_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Compute the 32-byte header tag.
pub fn header_hmac(key: &HeaderHmacKey, header: &[u8]) -> Cdoc2Result<[u8; HHK_LEN]> {
    let mut mac = new_mac(key)?;
    mac.update(header);
    Ok(mac.finalize().into_bytes().into())
}

/// Check a stored header tag in constant time.
pub fn verify_header_hmac(key: &HeaderHmacKey, header: &[u8], tag: &[u8]) -> Cdoc2Result<()> {
    let mut mac = new_mac(key)?;
    mac.update(header);
    mac.verify_slice(tag)
        .map_err(|_| Cdoc2Error::Integrity("header HMAC mismatch".into()))
}

fn new_mac(key: &HeaderHmacKey) -> Cdoc2Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| Cdoc2Error::Crypto(format!("HMAC key rejected: {e}")))
}
