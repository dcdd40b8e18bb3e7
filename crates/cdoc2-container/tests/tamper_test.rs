//! Integration tests: malformed and tampered envelopes.
//!
//! Malformed framing must fail as a parse error; a well-formed document that
//! was modified must fail as an integrity error, and no file may be released
//! into the destination when that happens.

use std::fs;
use std::path::{Path, PathBuf};

use cdoc2_container::{Envelope, Recipient, MIN_ENVELOPE_LEN};
use cdoc2_core::EnvelopeOptions;
use cdoc2_crypto::{wrap_fmk_ephemeral, EcKeyPair, FileMasterKey, FMK_LEN};
use proptest::prelude::*;
use tempfile::TempDir;

struct Sealed {
    _tmp: TempDir,
    pair: EcKeyPair,
    fmk: FileMasterKey,
    cdoc: Vec<u8>,
}

impl Sealed {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pair = EcKeyPair::generate();
        let files: Vec<PathBuf> = vec![
            write_test_file(tmp.path(), "a.txt", b"first file"),
            write_test_file(tmp.path(), "b.txt", &[0x5a; 70_000]),
        ];
        let fmk = FileMasterKey::from_bytes([0x33; FMK_LEN]);
        let cdoc = Envelope::prepare_ephemeral(&fmk, &[*pair.public_key()])
            .unwrap()
            .encrypt(&files, Vec::new(), &EnvelopeOptions::default())
            .unwrap();
        Self {
            _tmp: tmp,
            pair,
            fmk,
            cdoc,
        }
    }

    fn header_len(&self) -> usize {
        u32::from_be_bytes([self.cdoc[5], self.cdoc[6], self.cdoc[7], self.cdoc[8]]) as usize
    }

    fn header_range(&self) -> std::ops::Range<usize> {
        9..9 + self.header_len()
    }

    fn payload_start(&self) -> usize {
        9 + self.header_len() + 32
    }
}

fn write_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("write test file");
    path
}

fn flip(bytes: &[u8], index: usize, bit: u8) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out[index] ^= 1 << bit;
    out
}

fn decrypt_into(
    cdoc: &[u8],
    pair: &EcKeyPair,
    dest: &Path,
) -> cdoc2_core::Cdoc2Result<Vec<String>> {
    Envelope::decrypt(cdoc, pair, dest, &EnvelopeOptions::default())
}

fn released(dest: &Path) -> usize {
    fs::read_dir(dest).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn short_input_is_parse_error() {
    let sealed = Sealed::new();
    for len in [0, 3, 8, MIN_ENVELOPE_LEN - 1] {
        let err = Envelope::list(&sealed.cdoc[..len], &sealed.pair, &EnvelopeOptions::default())
            .unwrap_err();
        assert!(err.is_parse(), "len {len}: {err}");
    }
}

#[test]
fn wrong_prelude_is_parse_error() {
    let sealed = Sealed::new();
    let mut cdoc = sealed.cdoc.clone();
    cdoc[..4].copy_from_slice(b"PDF-");

    let err = Envelope::list(cdoc.as_slice(), &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err();
    assert!(err.is_parse());
    assert!(err.to_string().contains("prelude"));
}

#[test]
fn wrong_version_is_parse_error() {
    let sealed = Sealed::new();
    for version in [0x00, 0x01, 0x03, 0xff] {
        let mut cdoc = sealed.cdoc.clone();
        cdoc[4] = version;
        let err = Envelope::list(cdoc.as_slice(), &sealed.pair, &EnvelopeOptions::default())
            .unwrap_err();
        assert!(err.is_parse(), "version {version:#x}");
    }
}

#[test]
fn header_length_disagreeing_with_input_is_parse_error() {
    let sealed = Sealed::new();

    // Claims more header than the whole document holds
    let mut cdoc = sealed.cdoc.clone();
    cdoc[5..9].copy_from_slice(&(sealed.cdoc.len() as u32).to_be_bytes());
    let err = Envelope::list(cdoc.as_slice(), &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err();
    assert!(err.is_parse());

    // Document cut off inside the header
    let cut = &sealed.cdoc[..sealed.header_range().end - 1];
    assert!(Envelope::list(cut, &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err()
        .is_parse());

    // Below the minimum header length
    let mut cdoc = sealed.cdoc.clone();
    cdoc[5..9].copy_from_slice(&1u32.to_be_bytes());
    assert!(Envelope::list(cdoc.as_slice(), &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err()
        .is_parse());
}

#[test]
fn truncated_hmac_is_parse_error() {
    let sealed = Sealed::new();
    let cut = &sealed.cdoc[..sealed.payload_start() - 1];
    assert!(Envelope::list(cut, &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err()
        .is_parse());
}

#[test]
fn wrapped_fmk_bit_flip_is_integrity_error() {
    let sealed = Sealed::new();
    let header = Envelope::read_header(sealed.cdoc.as_slice()).unwrap();
    let wrapped = *header.recipients[0].encrypted_fmk();

    let range = sealed.header_range();
    let offset = sealed.cdoc[range.clone()]
        .windows(FMK_LEN)
        .position(|w| w == wrapped)
        .expect("wrapped FMK present in header")
        + range.start;

    let tmp = TempDir::new().unwrap();
    for index in offset..offset + FMK_LEN {
        for bit in [0, 3, 7] {
            let cdoc = flip(&sealed.cdoc, index, bit);
            let dest = tmp.path().join(format!("out-{index}-{bit}"));
            let err = decrypt_into(&cdoc, &sealed.pair, &dest).unwrap_err();
            assert!(err.is_integrity(), "byte {index} bit {bit}: {err}");
            assert_eq!(released(&dest), 0);
        }
    }
}

#[test]
fn substituted_header_is_integrity_error() {
    // Add a recipient to the header in transit, keeping the original HMAC
    let sealed = Sealed::new();
    let mut header = Envelope::read_header(sealed.cdoc.as_slice()).unwrap();
    let intruder = EcKeyPair::generate();
    header.recipients.push(Recipient::Ecc(
        wrap_fmk_ephemeral(&sealed.fmk, intruder.public_key()).unwrap(),
    ));
    let forged_header = header.serialize();

    let mut cdoc = Vec::new();
    cdoc.extend_from_slice(&sealed.cdoc[..5]);
    cdoc.extend_from_slice(&(forged_header.len() as u32).to_be_bytes());
    cdoc.extend_from_slice(&forged_header);
    cdoc.extend_from_slice(&sealed.cdoc[sealed.header_range().end..]);

    let tmp = TempDir::new().unwrap();
    for pair in [&sealed.pair, &intruder] {
        let err = decrypt_into(&cdoc, pair, tmp.path()).unwrap_err();
        assert!(err.is_integrity(), "{err}");
    }
    assert_eq!(released(tmp.path()), 0);
}

#[test]
fn payload_swapped_between_documents_is_integrity_error() {
    let one = Sealed::new();
    let two = Sealed::new();

    // Same FMK, different header: the payload is bound to its own header
    let mut cdoc = one.cdoc[..one.payload_start()].to_vec();
    cdoc.extend_from_slice(&two.cdoc[two.payload_start()..]);

    let tmp = TempDir::new().unwrap();
    let err = decrypt_into(&cdoc, &one.pair, tmp.path()).unwrap_err();
    assert!(err.is_integrity());
    assert_eq!(released(tmp.path()), 0);
}

#[test]
fn truncated_payload_is_integrity_error() {
    let sealed = Sealed::new();
    let tmp = TempDir::new().unwrap();
    for cut in [sealed.payload_start() + 3, sealed.cdoc.len() - 1] {
        let err = decrypt_into(&sealed.cdoc[..cut], &sealed.pair, tmp.path()).unwrap_err();
        assert!(err.is_integrity(), "cut at {cut}: {err}");
    }
    assert_eq!(released(tmp.path()), 0);
}

#[test]
fn trailing_garbage_is_integrity_error() {
    let sealed = Sealed::new();
    let mut cdoc = sealed.cdoc.clone();
    cdoc.extend_from_slice(b"trailing");

    let tmp = TempDir::new().unwrap();
    assert!(decrypt_into(&cdoc, &sealed.pair, tmp.path())
        .unwrap_err()
        .is_integrity());
}

#[test]
fn tampered_listing_returns_nothing() {
    let sealed = Sealed::new();
    let last = sealed.cdoc.len() - 1;
    let cdoc = flip(&sealed.cdoc, last, 0);

    let err = Envelope::list(cdoc.as_slice(), &sealed.pair, &EnvelopeOptions::default())
        .unwrap_err();
    assert!(err.is_integrity());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any single-bit flip in the payload is caught, and nothing is released
    #[test]
    fn payload_bit_flip_detected(pos in any::<prop::sample::Index>(), bit in 0u8..8) {
        let sealed = Sealed::new();
        let start = sealed.payload_start();
        let index = start + pos.index(sealed.cdoc.len() - start);
        let cdoc = flip(&sealed.cdoc, index, bit);

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let err = decrypt_into(&cdoc, &sealed.pair, &dest).unwrap_err();
        prop_assert!(err.is_integrity(), "byte {} bit {}: {}", index, bit, err);
        prop_assert_eq!(released(&dest), 0);
    }

    /// Any single-bit flip in the header is rejected, never decrypted
    #[test]
    fn header_bit_flip_rejected(pos in any::<prop::sample::Index>(), bit in 0u8..8) {
        let sealed = Sealed::new();
        let range = sealed.header_range();
        let index = range.start + pos.index(range.len());
        let cdoc = flip(&sealed.cdoc, index, bit);

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let err = decrypt_into(&cdoc, &sealed.pair, &dest).unwrap_err();
        prop_assert!(err.is_parse() || err.is_integrity(), "byte {} bit {}: {}", index, bit, err);
        prop_assert_eq!(released(&dest), 0);
    }
}
