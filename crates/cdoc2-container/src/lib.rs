//! cdoc2-container: header codec, payload packager, and the envelope pipeline

pub mod envelope;
pub mod header;
pub mod payload;

pub use envelope::{Envelope, MIN_ENVELOPE_LEN, PRELUDE, VERSION};
pub use header::{
    Header, KeyServerRecipient, OpaqueRecipient, PayloadEncryptionMethod, Recipient,
    MIN_HEADER_LEN,
};
pub use payload::{PayloadCodec, StagedExtraction, TarGzCodec};
