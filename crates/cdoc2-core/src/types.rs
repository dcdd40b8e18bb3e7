use serde::{Deserialize, Serialize};

/// One entry of a decrypted payload, as reported by listing or extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Modification time, seconds since the Unix epoch
    pub modified: u64,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, size: u64, modified: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            modified,
        }
    }
}
