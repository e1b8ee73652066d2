//! Safe expansion of untrusted tar archives.
//!
//! Archives come from caller-supplied URLs and must be treated as hostile:
//! every entry name is normalized and confined to the destination, link
//! targets are resolved lexically and rejected if they escape, declared
//! and actual sizes are capped, and permission bits are clamped to one of
//! two modes. The first violation aborts the whole archive; the partially
//! populated destination is left for the caller to observe and remove.

use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, Entry, EntryType};
use thiserror::Error;
use tokio::sync::watch;
use tracing::trace;

/// Default cap on a single entry's bytes.
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024;

/// Default cap on the number of entries per archive.
pub const MAX_ENTRIES: usize = 10_000;

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive too large: more than {max} entries")]
    TooManyEntries { max: usize },

    #[error("file too large: {name} declares {size} bytes (max {max})")]
    EntryTooLarge { name: String, size: u64, max: u64 },

    #[error("path traversal attempt: {name}")]
    PathTraversal { name: String },

    #[error("absolute symlink not allowed: {name} -> {target}")]
    AbsoluteSymlink { name: String, target: String },

    #[error("symlink outside destination: {name} -> {target}")]
    SymlinkEscape { name: String, target: String },

    #[error("hardlink outside destination: {name} -> {target}")]
    HardlinkEscape { name: String, target: String },

    #[error("extraction canceled")]
    Canceled,
}

/// Archive extractor with per-entry resource caps.
pub struct Extractor {
    max_entry_size: u64,
    max_entries: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            max_entry_size: MAX_ENTRY_SIZE,
            max_entries: MAX_ENTRIES,
        }
    }

    /// Expand a tar (optionally gzip-compressed) archive into `dest_dir`.
    ///
    /// Compression is sniffed from the `.gz`/`.tgz` suffix. Cancellation is
    /// checked between entries.
    pub fn extract(
        &self,
        archive_path: &Path,
        dest_dir: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), ExtractError> {
        let file = File::open(archive_path)?;

        let gzipped = matches!(
            archive_path.extension().and_then(|e| e.to_str()),
            Some("gz") | Some("tgz")
        );

        if gzipped {
            self.extract_entries(Archive::new(GzDecoder::new(file)), dest_dir, cancel)
        } else {
            self.extract_entries(Archive::new(file), dest_dir, cancel)
        }
    }

    fn extract_entries<R: Read>(
        &self,
        mut archive: Archive<R>,
        dest_dir: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), ExtractError> {
        let mut count = 0usize;

        for entry in archive.entries()? {
            if *cancel.borrow() {
                return Err(ExtractError::Canceled);
            }

            let mut entry = entry?;

            count += 1;
            if count > self.max_entries {
                return Err(ExtractError::TooManyEntries {
                    max: self.max_entries,
                });
            }

            self.extract_entry(&mut entry, dest_dir)?;
        }

        Ok(())
    }

    fn extract_entry<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        dest_dir: &Path,
    ) -> Result<(), ExtractError> {
        let raw_name = entry.path()?.into_owned();
        let name = raw_name.display().to_string();

        let target = match sanitize_entry_path(dest_dir, &raw_name)? {
            Some(target) => target,
            // "." and "./" entries are accepted and skipped.
            None => return Ok(()),
        };

        let size = entry.header().size()?;
        if size > self.max_entry_size {
            return Err(ExtractError::EntryTooLarge {
                name,
                size,
                max: self.max_entry_size,
            });
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, Permissions::from_mode(0o755))?;
            }
            EntryType::Regular => self.write_regular(entry, &target)?,
            EntryType::Symlink => write_symlink(entry, &target, dest_dir, &name)?,
            EntryType::Link => write_hardlink(entry, &target, dest_dir, &name)?,
            other => {
                trace!(entry = %name, kind = ?other, "Skipping unsupported entry type");
            }
        }

        Ok(())
    }

    fn write_regular<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        target: &Path,
    ) -> Result<(), ExtractError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let header_mode = entry.header().mode()?;

        let mut file = File::create(target)?;
        // Cap the copy regardless of the declared size; headers lie.
        let mut limited = (&mut *entry).take(self.max_entry_size);
        io::copy(&mut limited, &mut file)?;

        let mode = if header_mode & 0o111 != 0 { 0o755 } else { 0o644 };
        fs::set_permissions(target, Permissions::from_mode(mode))?;

        Ok(())
    }
}

/// Confine an entry name to the destination. Returns `None` for the
/// skippable `.`/`./` entries; rejects `..` segments, absolute names, and
/// anything whose joined path would leave `dest_dir`.
fn sanitize_entry_path(
    dest_dir: &Path,
    name: &Path,
) -> Result<Option<PathBuf>, ExtractError> {
    let mut clean = PathBuf::new();

    for component in name.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::PathTraversal {
                    name: name.display().to_string(),
                });
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Ok(None);
    }

    Ok(Some(dest_dir.join(clean)))
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn write_symlink<R: Read>(
    entry: &Entry<'_, R>,
    target: &Path,
    dest_dir: &Path,
    name: &str,
) -> Result<(), ExtractError> {
    let link = entry
        .link_name()?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "symlink without target"))?
        .into_owned();

    if link.is_absolute() {
        return Err(ExtractError::AbsoluteSymlink {
            name: name.to_string(),
            target: link.display().to_string(),
        });
    }

    // The link is created with its original relative string; escape
    // detection resolves it against the symlink's own directory.
    let parent = target.parent().unwrap_or(dest_dir);
    let resolved = normalize_lexical(&parent.join(&link));
    if !resolved.starts_with(dest_dir) {
        return Err(ExtractError::SymlinkEscape {
            name: name.to_string(),
            target: link.display().to_string(),
        });
    }

    fs::create_dir_all(parent)?;
    std::os::unix::fs::symlink(&link, target)?;

    Ok(())
}

fn write_hardlink<R: Read>(
    entry: &Entry<'_, R>,
    target: &Path,
    dest_dir: &Path,
    name: &str,
) -> Result<(), ExtractError> {
    let link = entry
        .link_name()?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "hardlink without target"))?
        .into_owned();

    let resolved = normalize_lexical(&dest_dir.join(&link));
    if !resolved.starts_with(dest_dir) {
        return Err(ExtractError::HardlinkEscape {
            name: name.to_string(),
            target: link.display().to_string(),
        });
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(&resolved, target)?;

    Ok(())
}
