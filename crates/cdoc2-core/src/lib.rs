pub mod config;
pub mod error;
pub mod types;

pub use config::{Cdoc2Config, EnvelopeOptions, UnsupportedRecipientPolicy};
pub use error::{Cdoc2Error, Cdoc2Result};
pub use types::ArchiveEntry;
