//! Payload packager: files in, one byte stream out, and back
//!
//! The default codec is a gzip-compressed tar archive. Extraction never
//! writes into the destination directly: entries land in a staging
//! directory and are only moved into place by [`StagedExtraction::commit`],
//! which the envelope calls after the payload stream has authenticated.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use cdoc2_core::{ArchiveEntry, Cdoc2Error, Cdoc2Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

/// Bundles input files into a single stream and reverses it.
pub trait PayloadCodec {
    /// Pack `files` (in order) into `out`.
    fn pack(&self, files: &[PathBuf], out: &mut dyn Write) -> Cdoc2Result<()>;

    /// Enumerate the entries of a packed stream without writing anything.
    fn list(&self, input: &mut dyn Read) -> Cdoc2Result<Vec<ArchiveEntry>>;

    /// Write the entries named in `wanted` (all files when `None`) into
    /// `target`, returning what was written.
    fn extract(
        &self,
        input: &mut dyn Read,
        target: &Path,
        wanted: Option<&[String]>,
    ) -> Cdoc2Result<Vec<ArchiveEntry>>;
}

/// gzip-compressed tar.
#[derive(Debug, Clone, Copy)]
pub struct TarGzCodec {
    level: u32,
}

impl TarGzCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for TarGzCodec {
    fn default() -> Self {
        Self::new(9)
    }
}

impl PayloadCodec for TarGzCodec {
    fn pack(&self, files: &[PathBuf], out: &mut dyn Write) -> Cdoc2Result<()> {
        let mut names = HashSet::new();
        let gz = GzEncoder::new(out, Compression::new(self.level));
        let mut builder = tar::Builder::new(gz);

        for path in files {
            let meta = fs::metadata(path)?;
            if !meta.is_file() {
                return Err(invalid_input(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| invalid_input(format!("{} has no usable file name", path.display())))?
                .to_string();
            if !names.insert(name.clone()) {
                return Err(invalid_input(format!("duplicate file name in payload: {name}")));
            }

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            header.set_mode(0o644);
            header.set_mtime(modified_secs(&meta));

            let file = fs::File::open(path)?;
            builder.append_data(&mut header, &name, file)?;
            tracing::debug!(name = %name, size = meta.len(), "packed payload entry");
        }

        let gz = builder.into_inner()?;
        gz.finish()?;
        Ok(())
    }

    fn list(&self, input: &mut dyn Read) -> Cdoc2Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(GzDecoder::new(input));
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            entries.push(describe(&entry)?);
        }
        Ok(entries)
    }

    fn extract(
        &self,
        input: &mut dyn Read,
        target: &Path,
        wanted: Option<&[String]>,
    ) -> Cdoc2Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(GzDecoder::new(input));
        let mut written = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let info = describe(&entry)?;
            let name = safe_name(&info.name)?;

            if !entry.header().entry_type().is_file() {
                tracing::debug!(name = %info.name, "skipping non-file entry");
                continue;
            }
            if let Some(wanted) = wanted {
                if !wanted.iter().any(|w| w == name) {
                    continue;
                }
            }

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(target.join(name))?;
            io::copy(&mut entry, &mut file)?;
            written.push(info);
        }

        if let Some(wanted) = wanted {
            for name in wanted {
                if !written.iter().any(|e| &e.name == name) {
                    return Err(Cdoc2Error::Parse(format!("entry not found in payload: {name}")));
                }
            }
        }
        Ok(written)
    }
}

fn describe<R: Read>(entry: &tar::Entry<'_, R>) -> Cdoc2Result<ArchiveEntry> {
    let header = entry.header();
    Ok(ArchiveEntry {
        name: entry.path()?.to_string_lossy().into_owned(),
        size: header.size()?,
        is_dir: header.entry_type().is_dir(),
        modified: header.mtime()?,
    })
}

/// Entry names must be a single plain file name; anything that could
/// escape the target directory is a malformed payload.
pub fn safe_name(name: &str) -> Cdoc2Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name.trim_end_matches('/')),
        _ => Err(Cdoc2Error::Parse(format!("unsafe entry name in payload: {name:?}"))),
    }
}

fn invalid_input(msg: String) -> Cdoc2Error {
    Cdoc2Error::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

pub(crate) fn modified_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Files written to a private staging directory inside the destination,
/// waiting to be released.
///
/// Dropping without `commit` removes everything that was staged.
#[derive(Debug)]
pub struct StagedExtraction {
    staging: TempDir,
    dest: PathBuf,
    entries: Vec<ArchiveEntry>,
}

impl StagedExtraction {
    pub fn new(dest: &Path) -> Cdoc2Result<Self> {
        fs::create_dir_all(dest)?;
        let staging = tempfile::Builder::new()
            .prefix(".cdoc2-staging-")
            .tempdir_in(dest)?;
        Ok(Self {
            staging,
            dest: dest.to_path_buf(),
            entries: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.staging.path()
    }

    pub fn record(&mut self, entries: Vec<ArchiveEntry>) {
        self.entries.extend(entries);
    }

    /// Move every staged entry into the destination and return their names.
    ///
    /// Existing files are never replaced. Either every entry is released or,
    /// on error, none is left behind in the destination.
    pub fn commit(self) -> Cdoc2Result<Vec<String>> {
        for entry in &self.entries {
            let to = self.dest.join(&entry.name);
            if to.symlink_metadata().is_ok() {
                return Err(Cdoc2Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("refusing to overwrite {}", to.display()),
                )));
            }
        }

        let mut released: Vec<PathBuf> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let from = self.staging.path().join(&entry.name);
            let to = self.dest.join(&entry.name);
            // hard_link fails on an existing target, closing the gap after the check above
            if let Err(e) = fs::hard_link(&from, &to) {
                for path in &released {
                    if let Err(cleanup) = fs::remove_file(path) {
                        tracing::warn!(path = %path.display(), error = %cleanup, "rollback failed");
                    }
                }
                return Err(e.into());
            }
            tracing::debug!(path = %to.display(), "released extracted file");
            released.push(to);
        }

        // staged copies go with the staging directory
        Ok(self.entries.iter().map(|e| e.name.clone()).collect())
    }
}
