//! Envelope pipeline: the CDOC2 wire format end to end
//!
//! ```text
//! [4 bytes: "CDOC"][1 byte: version 0x02][4 bytes: header length, big-endian]
//! [header][32 bytes: HMAC-SHA256(HHK, header)]
//! [payload: STREAM ChaCha20-Poly1305, AAD = "CDOC20payload" || header || HMAC]
//! ```
//!
//! Decryption runs strictly in order: prelude and version, header length,
//! header bytes, header decode, recipient match, FMK unwrap, HMAC check,
//! payload stream. Nothing is released to the destination until the payload
//! stream has authenticated to its last segment.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cdoc2_core::{
    ArchiveEntry, Cdoc2Error, Cdoc2Result, EnvelopeOptions, UnsupportedRecipientPolicy,
};
use cdoc2_crypto::{
    derive_content_encryption_key, derive_header_hmac_key, generate_fmk, header_hmac,
    payload_aad, unwrap_fmk, verify_header_hmac, wrap_fmk, wrap_fmk_ephemeral,
    ContentEncryptionKey, DecryptingReader, EcKeyPair, EccRecipient, EncryptingWriter,
    FileMasterKey, HeaderHmacKey, PublicKey, HHK_LEN,
};

use crate::header::{Header, Recipient, MIN_HEADER_LEN};
use crate::payload::{safe_name, PayloadCodec, StagedExtraction, TarGzCodec};

/// Magic bytes at the start of every envelope.
pub const PRELUDE: &[u8; 4] = b"CDOC";

/// The only accepted format version.
pub const VERSION: u8 = 0x02;

const PREAMBLE_LEN: usize = PRELUDE.len() + 1 + 4;

/// Shortest byte sequence that can be a well-formed envelope up to the payload.
pub const MIN_ENVELOPE_LEN: usize = PREAMBLE_LEN + MIN_HEADER_LEN + HHK_LEN;

/// Recipient list plus the two FMK-derived keys for one encrypt or decrypt
/// operation. The FMK itself is not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    recipients: Vec<Recipient>,
    hmac_key: HeaderHmacKey,
    content_key: ContentEncryptionKey,
}

impl Envelope {
    /// Build an envelope from ready-made recipient records.
    pub fn new(fmk: &FileMasterKey, recipients: Vec<Recipient>) -> Cdoc2Result<Self> {
        if recipients.is_empty() {
            return Err(Cdoc2Error::Crypto(
                "an envelope needs at least one recipient".into(),
            ));
        }
        Ok(Self {
            recipients,
            hmac_key: derive_header_hmac_key(fmk)?,
            content_key: derive_content_encryption_key(fmk)?,
        })
    }

    /// Wrap `fmk` for every recipient with one static sender key pair.
    ///
    /// The XOR wrap is only safe if this sender/recipient pair never wraps a
    /// different FMK; prefer [`Envelope::prepare_ephemeral`].
    pub fn prepare(
        fmk: &FileMasterKey,
        sender: &EcKeyPair,
        recipients: &[PublicKey],
    ) -> Cdoc2Result<Self> {
        let records = recipients
            .iter()
            .map(|r| wrap_fmk(fmk, sender, r).map(Recipient::Ecc))
            .collect::<Cdoc2Result<Vec<_>>>()?;
        Self::new(fmk, records)
    }

    /// Wrap `fmk` for every recipient, each with its own fresh sender key.
    pub fn prepare_ephemeral(fmk: &FileMasterKey, recipients: &[PublicKey]) -> Cdoc2Result<Self> {
        let records = recipients
            .iter()
            .map(|r| wrap_fmk_ephemeral(fmk, r).map(Recipient::Ecc))
            .collect::<Cdoc2Result<Vec<_>>>()?;
        Self::new(fmk, records)
    }

    /// New random FMK, ephemeral sender keys.
    pub fn for_recipients(recipients: &[PublicKey]) -> Cdoc2Result<Self> {
        let fmk = generate_fmk()?;
        Self::prepare_ephemeral(&fmk, recipients)
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn header(&self) -> Header {
        Header::new(self.recipients.clone())
    }

    /// Package `files` and write the complete envelope to `out`.
    pub fn encrypt<W: Write>(
        &self,
        files: &[PathBuf],
        out: W,
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<W> {
        if options.disable_compression {
            if let [single] = files {
                if is_packaged(single) {
                    tracing::warn!(
                        file = %single.display(),
                        "packaging disabled: encrypting the archive as-is"
                    );
                    return self.encrypt_raw(fs::File::open(single)?, out);
                }
            }
        }

        let codec = TarGzCodec::new(options.compression_level);
        self.seal(out, |sink| codec.pack(files, sink))
    }

    /// Encrypt an already-packaged payload without touching it.
    pub fn encrypt_raw<R: Read, W: Write>(&self, mut payload: R, out: W) -> Cdoc2Result<W> {
        self.seal(out, |sink| {
            io::copy(&mut payload, sink)?;
            Ok(())
        })
    }

    fn seal<W: Write>(
        &self,
        mut out: W,
        fill: impl FnOnce(&mut dyn Write) -> Cdoc2Result<()>,
    ) -> Cdoc2Result<W> {
        let header = self.header().serialize();
        let hmac = header_hmac(&self.hmac_key, &header)?;
        let header_len = u32::try_from(header.len()).map_err(|_| {
            Cdoc2Error::Parse(format!("header too large: {} bytes", header.len()))
        })?;

        out.write_all(PRELUDE)?;
        out.write_all(&[VERSION])?;
        out.write_all(&header_len.to_be_bytes())?;
        out.write_all(&header)?;
        out.write_all(&hmac)?;

        let mut sink = EncryptingWriter::new(out, &self.content_key, payload_aad(&header, &hmac))?;
        fill(&mut sink)?;
        let out = sink.finish()?;

        tracing::info!(
            recipients = self.recipients.len(),
            header_len,
            "envelope written"
        );
        Ok(out)
    }

    /// Decrypt and extract every file into `dest`.
    pub fn decrypt<R: Read>(
        input: R,
        key_pair: &EcKeyPair,
        dest: &Path,
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<Vec<String>> {
        Self::decrypt_into(input, key_pair, dest, None, options)
    }

    /// Decrypt and extract only the entries named in `names`.
    pub fn decrypt_files<R: Read>(
        input: R,
        key_pair: &EcKeyPair,
        dest: &Path,
        names: &[String],
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<Vec<String>> {
        Self::decrypt_into(input, key_pair, dest, Some(names), options)
    }

    /// Decrypt and list the payload entries without writing any file.
    pub fn list<R: Read>(
        input: R,
        key_pair: &EcKeyPair,
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<Vec<ArchiveEntry>> {
        let mut reader = Self::open(input, key_pair, options)?;
        let listed = TarGzCodec::new(options.compression_level).list(&mut reader);
        settle(listed, &mut reader)
    }

    /// Read and decode the header only. Needs no key and does not check the HMAC.
    pub fn read_header<R: Read>(mut input: R) -> Cdoc2Result<Header> {
        let bytes = read_header_bytes(&mut input)?;
        Header::deserialize(&bytes)
    }

    fn decrypt_into<R: Read>(
        input: R,
        key_pair: &EcKeyPair,
        dest: &Path,
        wanted: Option<&[String]>,
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<Vec<String>> {
        let mut reader = Self::open(input, key_pair, options)?;
        let mut staged = StagedExtraction::new(dest)?;

        if let Some(raw_name) = options.raw_decrypt_name() {
            let file_name = raw_output_name(raw_name)?;
            if let Some(names) = wanted.filter(|n| !n.is_empty()) {
                tracing::warn!(
                    ignored = names.len(),
                    "packaging disabled: entry selection does not apply to a raw payload"
                );
            }
            tracing::warn!(
                file = %file_name,
                "packaging disabled: writing the decrypted payload without unpacking"
            );
            let copied = fs::File::create(staged.path().join(&file_name))
                .and_then(|mut file| io::copy(&mut reader, &mut file))
                .map_err(Cdoc2Error::from);
            let size = settle(copied, &mut reader)?;
            staged.record(vec![ArchiveEntry::file(file_name, size, now_secs())]);
        } else {
            let codec = TarGzCodec::new(options.compression_level);
            let extracted = codec.extract(&mut reader, staged.path(), wanted);
            staged.record(settle(extracted, &mut reader)?);
        }

        let names = staged.commit()?;
        tracing::info!(files = names.len(), dest = %dest.display(), "envelope decrypted");
        Ok(names)
    }

    /// Run the decrypt state machine up to an open payload stream.
    ///
    /// The returned reader yields unauthenticated plaintext until it reports
    /// `is_verified`.
    fn open<R: Read>(
        mut input: R,
        key_pair: &EcKeyPair,
        options: &EnvelopeOptions,
    ) -> Cdoc2Result<DecryptingReader<R>> {
        let header_bytes = read_header_bytes(&mut input)?;
        let header = Header::deserialize(&header_bytes)?;

        let record = select_recipient(
            &header.recipients,
            key_pair.public_key(),
            options.unsupported_recipients,
        )?;
        let fmk = unwrap_fmk(record, key_pair)?;
        let hmac_key = derive_header_hmac_key(&fmk)?;
        let content_key = derive_content_encryption_key(&fmk)?;
        drop(fmk);

        let mut stored_hmac = [0u8; HHK_LEN];
        read_exact_or_parse(&mut input, &mut stored_hmac, "envelope truncated in header HMAC")?;
        verify_header_hmac(&hmac_key, &header_bytes, &stored_hmac)?;
        tracing::debug!(stage = "hmac", "header authenticated");

        DecryptingReader::new(
            input,
            &content_key,
            payload_aad(&header_bytes, &stored_hmac),
        )
    }
}

/// Prelude, version, length, and the header bytes themselves.
fn read_header_bytes<R: Read>(input: &mut R) -> Cdoc2Result<Vec<u8>> {
    let mut preamble = [0u8; PREAMBLE_LEN];
    read_exact_or_parse(
        input,
        &mut preamble,
        "input shorter than the minimum envelope length",
    )?;

    if &preamble[..PRELUDE.len()] != PRELUDE {
        return Err(Cdoc2Error::Parse("not a CDOC2 envelope: bad prelude".into()));
    }
    let version = preamble[PRELUDE.len()];
    if version != VERSION {
        return Err(Cdoc2Error::Parse(format!(
            "unsupported envelope version {version:#04x}"
        )));
    }

    let header_len = u32::from_be_bytes([preamble[5], preamble[6], preamble[7], preamble[8]]);
    if (header_len as usize) < MIN_HEADER_LEN {
        return Err(Cdoc2Error::Parse(format!(
            "header length {header_len} is below the minimum of {MIN_HEADER_LEN}"
        )));
    }

    let mut header = Vec::new();
    input
        .take(u64::from(header_len))
        .read_to_end(&mut header)?;
    if header.len() != header_len as usize {
        return Err(Cdoc2Error::Parse(format!(
            "header length field says {header_len} bytes but only {} are present",
            header.len()
        )));
    }

    tracing::debug!(stage = "header", header_len, "header read");
    Ok(header)
}

fn read_exact_or_parse<R: Read>(input: &mut R, buf: &mut [u8], msg: &str) -> Cdoc2Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Cdoc2Error::Parse(msg.to_string())
        } else {
            Cdoc2Error::Io(e)
        }
    })
}

/// Apply the unsupported-record policy, then find the caller's record.
fn select_recipient<'a>(
    recipients: &'a [Recipient],
    public: &PublicKey,
    policy: UnsupportedRecipientPolicy,
) -> Cdoc2Result<&'a EccRecipient> {
    for (index, recipient) in recipients.iter().enumerate() {
        if matches!(recipient, Recipient::Ecc(_)) {
            continue;
        }
        match policy {
            UnsupportedRecipientPolicy::Reject => {
                return Err(Cdoc2Error::Parse(format!(
                    "recipient {index}: {} records are not supported",
                    recipient.kind()
                )));
            }
            UnsupportedRecipientPolicy::Skip => {
                tracing::warn!(
                    index,
                    kind = recipient.kind(),
                    "skipping unsupported recipient record"
                );
            }
        }
    }

    recipients
        .iter()
        .find_map(|r| match r {
            Recipient::Ecc(ecc) if ecc.is_for(public) => Some(ecc),
            _ => None,
        })
        .ok_or_else(|| Cdoc2Error::Parse("no matching recipient".into()))
}

/// Combine the packager's result with the payload's authentication status.
///
/// The rest of the stream is always drained so the final tag is checked;
/// an authentication failure wins over whatever the packager reported.
fn settle<T, R: Read>(result: Cdoc2Result<T>, reader: &mut DecryptingReader<R>) -> Cdoc2Result<T> {
    let verified = finish_payload(reader);
    match (result, verified) {
        (_, Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Ok(value), Ok(())) => Ok(value),
    }
}

fn finish_payload<R: Read>(reader: &mut DecryptingReader<R>) -> Cdoc2Result<()> {
    let drained = match reader.failure() {
        Some(_) => Ok(0),
        None => io::copy(&mut *reader, &mut io::sink()),
    };
    if let Some(msg) = reader.failure() {
        return Err(Cdoc2Error::Integrity(msg.to_string()));
    }
    drained?;
    if !reader.is_verified() {
        return Err(Cdoc2Error::Integrity(
            "payload ended before its final segment".into(),
        ));
    }
    tracing::debug!(stage = "payload", "payload authenticated");
    Ok(())
}

fn is_packaged(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| {
            let n = n.to_ascii_lowercase();
            n.ends_with(".tgz") || n.ends_with(".tar.gz")
        })
        .unwrap_or(false)
}

/// `<name>.tgz`, with a trailing `.cdoc` dropped from `name`.
fn raw_output_name(name: &str) -> Cdoc2Result<String> {
    let base = name.strip_suffix(".cdoc").unwrap_or(name);
    let file = format!("{base}.tgz");
    safe_name(&file)?;
    Ok(file)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
