use serde::{Deserialize, Serialize};

use crate::error::{Cdoc2Error, Cdoc2Result};

/// Top-level configuration (loaded from cdoc2.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cdoc2Config {
    pub log: LogConfig,
    pub envelope: EnvelopeConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info); RUST_LOG takes precedence
    pub level: String,
    /// Log format: "text" or "json"
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// What to do with a recipient record this implementation cannot open
/// (key-server records and unknown details types).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsupportedRecipientPolicy {
    /// Refuse the whole document.
    #[default]
    Reject,
    /// Log a warning and keep scanning the remaining records.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub unsupported_recipients: UnsupportedRecipientPolicy,
    /// gzip level used by the payload packager (0-9, default: 9)
    pub compression_level: u32,
}

/// Diagnostic switches. Never enabled unless set explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Encrypt a single pre-built .tgz as-is, and decrypt without unpacking
    pub disable_compression: bool,
    /// Base name of the raw payload written when decrypting without unpacking
    pub raw_payload_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            unsupported_recipients: UnsupportedRecipientPolicy::Reject,
            compression_level: 9,
        }
    }
}

impl Cdoc2Config {
    /// Parse a cdoc2.toml document and reject out-of-range values.
    pub fn from_toml_str(content: &str) -> Cdoc2Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Cdoc2Error::Config(e.to_string()))?;
        if config.envelope.compression_level > 9 {
            return Err(Cdoc2Error::Config(format!(
                "envelope.compression_level must be 0-9, got {}",
                config.envelope.compression_level
            )));
        }
        Ok(config)
    }
}

/// Per-operation options handed to the envelope pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeOptions {
    pub unsupported_recipients: UnsupportedRecipientPolicy,
    pub compression_level: u32,
    pub disable_compression: bool,
    pub raw_payload_name: Option<String>,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self::from(&Cdoc2Config::default())
    }
}

impl From<&Cdoc2Config> for EnvelopeOptions {
    fn from(config: &Cdoc2Config) -> Self {
        Self {
            unsupported_recipients: config.envelope.unsupported_recipients,
            compression_level: config.envelope.compression_level.min(9),
            disable_compression: config.diagnostics.disable_compression,
            raw_payload_name: config.diagnostics.raw_payload_name.clone(),
        }
    }
}

impl EnvelopeOptions {
    /// Raw decrypt is only taken when both diagnostic settings are present.
    pub fn raw_decrypt_name(&self) -> Option<&str> {
        if !self.disable_compression {
            return None;
        }
        self.raw_payload_name.as_deref().filter(|n| !n.is_empty())
    }
}
