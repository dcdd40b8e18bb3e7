//! Integration tests: files → envelope → files.
//!
//! Every test works on real files in a temp directory and checks what ends
//! up in the destination directory, not just the returned names.

use std::fs;
use std::path::{Path, PathBuf};

use cdoc2_container::{
    Envelope, KeyServerRecipient, PayloadCodec, Recipient, TarGzCodec, MIN_HEADER_LEN, PRELUDE,
    VERSION,
};
use cdoc2_core::{EnvelopeOptions, UnsupportedRecipientPolicy};
use cdoc2_crypto::{wrap_fmk_ephemeral, EcKeyPair, FileMasterKey, FMK_LEN};
use tempfile::TempDir;

fn write_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("write test file");
    path
}

fn encrypt_for(recipients: &[&EcKeyPair], files: &[PathBuf]) -> Vec<u8> {
    let keys: Vec<_> = recipients.iter().map(|r| *r.public_key()).collect();
    Envelope::for_recipients(&keys)
        .unwrap()
        .encrypt(files, Vec::new(), &EnvelopeOptions::default())
        .expect("encrypt should succeed")
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn roundtrip_multiple_files() {
    let tmp = TempDir::new().unwrap();
    let alice = EcKeyPair::generate();

    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    let files = vec![
        write_test_file(tmp.path(), "notes.txt", b"meeting at noon"),
        write_test_file(tmp.path(), "empty.bin", b""),
        write_test_file(tmp.path(), "big.bin", &big),
    ];
    let cdoc = encrypt_for(&[&alice], &files);

    let out = tmp.path().join("out");
    let mut written = Envelope::decrypt(
        cdoc.as_slice(),
        &alice,
        &out,
        &EnvelopeOptions::default(),
    )
    .expect("decrypt should succeed");
    written.sort();

    assert_eq!(written, ["big.bin", "empty.bin", "notes.txt"]);
    assert_eq!(dir_names(&out), written, "no staging leftovers");
    assert_eq!(fs::read(out.join("notes.txt")).unwrap(), b"meeting at noon");
    assert_eq!(fs::read(out.join("empty.bin")).unwrap(), b"");
    assert_eq!(fs::read(out.join("big.bin")).unwrap(), big);
}

#[test]
fn every_recipient_can_decrypt() {
    let tmp = TempDir::new().unwrap();
    let recipients: Vec<EcKeyPair> = (0..4).map(|_| EcKeyPair::generate()).collect();
    let refs: Vec<&EcKeyPair> = recipients.iter().collect();

    let file = write_test_file(tmp.path(), "shared.txt", b"for all four of us");
    let cdoc = encrypt_for(&refs, &[file]);

    for (i, pair) in recipients.iter().enumerate() {
        let out = tmp.path().join(format!("out-{i}"));
        Envelope::decrypt(cdoc.as_slice(), pair, &out, &EnvelopeOptions::default())
            .unwrap_or_else(|e| panic!("recipient {i} failed: {e}"));
        assert_eq!(
            fs::read(out.join("shared.txt")).unwrap(),
            b"for all four of us"
        );
    }
}

#[test]
fn static_sender_envelope_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let sender = EcKeyPair::generate();
    let bob = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "memo.txt", b"static sender");

    let fmk = FileMasterKey::from_bytes([0x24; FMK_LEN]);
    let envelope = Envelope::prepare(&fmk, &sender, &[*bob.public_key()]).unwrap();
    let cdoc = envelope
        .encrypt(&[file], Vec::new(), &EnvelopeOptions::default())
        .unwrap();

    let listed = Envelope::list(cdoc.as_slice(), &bob, &EnvelopeOptions::default()).unwrap();
    assert_eq!(listed[0].name, "memo.txt");

    let header = Envelope::read_header(cdoc.as_slice()).unwrap();
    match &header.recipients[0] {
        Recipient::Ecc(r) => assert_eq!(r.sender_public_key(), sender.public_key()),
        other => panic!("unexpected record {other:?}"),
    }
}

#[test]
fn wrong_key_is_no_matching_recipient() {
    let tmp = TempDir::new().unwrap();
    let alice = EcKeyPair::generate();
    let mallory = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"private");
    let cdoc = encrypt_for(&[&alice], &[file]);

    let out = tmp.path().join("out");
    let err = Envelope::decrypt(cdoc.as_slice(), &mallory, &out, &EnvelopeOptions::default())
        .unwrap_err();

    assert!(err.is_parse(), "got {err:?}");
    assert!(err.to_string().contains("no matching recipient"));
    assert!(!out.exists(), "nothing is created before a recipient matches");
}

/// Fixed FMK, one recipient, one 10-byte file.
#[test]
fn concrete_single_file_scenario() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"0123456789");

    let fmk = FileMasterKey::from_bytes(*b"cdoc2 fixed file master key 32b!");
    let envelope = Envelope::prepare_ephemeral(&fmk, &[*pair.public_key()]).unwrap();
    let cdoc = envelope
        .encrypt(&[file], Vec::new(), &EnvelopeOptions::default())
        .unwrap();

    assert_eq!(&cdoc[..4], PRELUDE);
    assert_eq!(&cdoc[..4], b"CDOC");
    assert_eq!(cdoc[4], VERSION);
    assert_eq!(cdoc[4], 0x02);

    let header = envelope.header().serialize();
    let header_len = u32::from_be_bytes([cdoc[5], cdoc[6], cdoc[7], cdoc[8]]) as usize;
    assert_eq!(header_len, header.len());
    assert!(header_len >= MIN_HEADER_LEN);
    assert_eq!(&cdoc[9..9 + header_len], header.as_slice());

    let listed = Envelope::list(cdoc.as_slice(), &pair, &EnvelopeOptions::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "a.txt");
    assert_eq!(listed[0].size, 10);
    assert!(!listed[0].is_dir);

    let out = tmp.path().join("out");
    let written =
        Envelope::decrypt(cdoc.as_slice(), &pair, &out, &EnvelopeOptions::default()).unwrap();
    assert_eq!(written, ["a.txt"]);
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"0123456789");
}

#[test]
fn selective_extraction() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let files = vec![
        write_test_file(tmp.path(), "one.txt", b"1"),
        write_test_file(tmp.path(), "two.txt", b"22"),
        write_test_file(tmp.path(), "three.txt", b"333"),
    ];
    let cdoc = encrypt_for(&[&pair], &files);

    let out = tmp.path().join("out");
    let wanted = vec!["two.txt".to_string()];
    let written = Envelope::decrypt_files(
        cdoc.as_slice(),
        &pair,
        &out,
        &wanted,
        &EnvelopeOptions::default(),
    )
    .unwrap();

    assert_eq!(written, ["two.txt"]);
    assert_eq!(dir_names(&out), ["two.txt"]);

    let missing = vec!["four.txt".to_string()];
    let err = Envelope::decrypt_files(
        cdoc.as_slice(),
        &pair,
        &tmp.path().join("out2"),
        &missing,
        &EnvelopeOptions::default(),
    )
    .unwrap_err();
    assert!(err.is_parse());
    assert!(dir_names(&tmp.path().join("out2")).is_empty());
}

#[test]
fn key_server_record_follows_policy() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"policy");

    let fmk = FileMasterKey::from_bytes([7u8; FMK_LEN]);
    let recipients = vec![
        Recipient::KeyServer(KeyServerRecipient {
            recipient_public_key: *EcKeyPair::generate().public_key(),
            key_server_id: "server-1".into(),
            transaction_id: "tx-1".into(),
            encrypted_fmk: [0u8; FMK_LEN],
        }),
        Recipient::Ecc(wrap_fmk_ephemeral(&fmk, pair.public_key()).unwrap()),
    ];
    let cdoc = Envelope::new(&fmk, recipients)
        .unwrap()
        .encrypt(&[file], Vec::new(), &EnvelopeOptions::default())
        .unwrap();

    let err = Envelope::list(cdoc.as_slice(), &pair, &EnvelopeOptions::default()).unwrap_err();
    assert!(err.is_parse(), "fail closed by default, got {err:?}");

    let skip = EnvelopeOptions {
        unsupported_recipients: UnsupportedRecipientPolicy::Skip,
        ..EnvelopeOptions::default()
    };
    let listed = Envelope::list(cdoc.as_slice(), &pair, &skip).unwrap();
    assert_eq!(listed[0].name, "a.txt");
}

#[test]
fn raw_payload_bypass() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();

    // Build a .tgz ourselves and hand it over pre-packaged
    let inner = write_test_file(tmp.path(), "inner.txt", b"inside the tgz");
    let bundle = tmp.path().join("bundle.tgz");
    let mut tgz = Vec::new();
    TarGzCodec::default().pack(&[inner], &mut tgz).unwrap();
    fs::write(&bundle, &tgz).unwrap();

    let diagnostic = EnvelopeOptions {
        disable_compression: true,
        ..EnvelopeOptions::default()
    };
    let cdoc = Envelope::for_recipients(&[*pair.public_key()])
        .unwrap()
        .encrypt(&[bundle.clone()], Vec::new(), &diagnostic)
        .unwrap();

    // The payload is the bundle itself, so a normal decrypt unpacks it
    let out = tmp.path().join("out");
    Envelope::decrypt(cdoc.as_slice(), &pair, &out, &EnvelopeOptions::default()).unwrap();
    assert_eq!(fs::read(out.join("inner.txt")).unwrap(), b"inside the tgz");

    // Raw decrypt writes the payload back out untouched
    let raw = EnvelopeOptions {
        disable_compression: true,
        raw_payload_name: Some("document.cdoc".into()),
        ..EnvelopeOptions::default()
    };
    let raw_out = tmp.path().join("raw");
    let written = Envelope::decrypt(cdoc.as_slice(), &pair, &raw_out, &raw).unwrap();
    assert_eq!(written, ["document.tgz"]);
    assert_eq!(fs::read(raw_out.join("document.tgz")).unwrap(), tgz);
}

#[test]
fn raw_decrypt_writes_whole_payload_despite_selection() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"abc");
    let cdoc = encrypt_for(&[&pair], &[file]);

    let raw = EnvelopeOptions {
        disable_compression: true,
        raw_payload_name: Some("dump".into()),
        ..EnvelopeOptions::default()
    };
    let out = tmp.path().join("out");
    let written =
        Envelope::decrypt_files(cdoc.as_slice(), &pair, &out, &["a.txt".to_string()], &raw).unwrap();
    assert_eq!(written, ["dump.tgz"]);
    assert_eq!(dir_names(&out), ["dump.tgz"]);
}

#[test]
fn existing_destination_file_is_not_overwritten() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let files = vec![
        write_test_file(&src, "a.txt", b"from document"),
        write_test_file(&src, "b.txt", b"also from document"),
    ];
    let cdoc = encrypt_for(&[&pair], &files);

    let out = tmp.path().join("out");
    fs::create_dir(&out).unwrap();
    fs::write(out.join("b.txt"), b"USER DATA").unwrap();

    let err =
        Envelope::decrypt(cdoc.as_slice(), &pair, &out, &EnvelopeOptions::default()).unwrap_err();
    assert!(!err.is_integrity() && !err.is_parse(), "{err}");
    assert_eq!(fs::read(out.join("b.txt")).unwrap(), b"USER DATA");
    assert_eq!(dir_names(&out), ["b.txt"], "nothing released, no staging left");
}

#[test]
fn raw_name_without_disable_flag_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"abc");
    let cdoc = encrypt_for(&[&pair], &[file]);

    let options = EnvelopeOptions {
        raw_payload_name: Some("document.cdoc".into()),
        ..EnvelopeOptions::default()
    };
    let out = tmp.path().join("out");
    let written = Envelope::decrypt(cdoc.as_slice(), &pair, &out, &options).unwrap();
    assert_eq!(written, ["a.txt"]);
}

#[test]
fn explicit_encrypt_raw() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();

    let inner = write_test_file(tmp.path(), "x.txt", b"x");
    let mut tgz = Vec::new();
    TarGzCodec::new(1).pack(&[inner], &mut tgz).unwrap();

    let cdoc = Envelope::for_recipients(&[*pair.public_key()])
        .unwrap()
        .encrypt_raw(tgz.as_slice(), Vec::new())
        .unwrap();

    let listed = Envelope::list(cdoc.as_slice(), &pair, &EnvelopeOptions::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "x.txt");
}

#[test]
fn encrypt_writes_to_file() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    let file = write_test_file(tmp.path(), "a.txt", b"on disk");

    let path = tmp.path().join("doc.cdoc");
    let sink = fs::File::create(&path).unwrap();
    Envelope::for_recipients(&[*pair.public_key()])
        .unwrap()
        .encrypt(&[file], sink, &EnvelopeOptions::default())
        .unwrap();

    let input = fs::File::open(&path).unwrap();
    let out = tmp.path().join("out");
    Envelope::decrypt(input, &pair, &out, &EnvelopeOptions::default()).unwrap();
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"on disk");
}

#[test]
fn encrypt_rejects_duplicate_names() {
    let tmp = TempDir::new().unwrap();
    let pair = EcKeyPair::generate();
    fs::create_dir(tmp.path().join("x")).unwrap();
    let a = write_test_file(tmp.path(), "same.txt", b"1");
    let b = write_test_file(&tmp.path().join("x"), "same.txt", b"2");

    let result = Envelope::for_recipients(&[*pair.public_key()])
        .unwrap()
        .encrypt(&[a, b], Vec::new(), &EnvelopeOptions::default());
    assert!(result.is_err());
}
