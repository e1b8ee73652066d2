//! On-disk layout of the storage root.
//!
//! ```text
//! <root>/blobs/<checksum>.tar        content-addressed archives
//! <root>/images/<name>/rootfs/       extracted image roots
//! <root>/overlays/<name>/{upper,work} writable layer + kernel scratch
//! <root>/active/<name>               overlay mount points
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Pure path mapping for the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create the four top-level directories.
    pub fn init(&self) -> io::Result<()> {
        for dir in ["blobs", "images", "overlays", "active"] {
            std::fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob file for a checksum. The `.tar` suffix is cosmetic; the file
    /// may be plain or gzipped tar and the extractor sniffs.
    pub fn blob_path(&self, checksum: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{checksum}.tar"))
    }

    /// Per-image directory holding the extracted rootfs.
    pub fn image_dir(&self, name: &str) -> PathBuf {
        self.root.join("images").join(name)
    }

    /// Extracted image root, the lower layer of the overlay.
    pub fn image_root(&self, name: &str) -> PathBuf {
        self.image_dir(name).join("rootfs")
    }

    /// Per-image overlay directory holding upper and work.
    pub fn overlay_dir(&self, name: &str) -> PathBuf {
        self.root.join("overlays").join(name)
    }

    /// Writable upper layer.
    pub fn upper_dir(&self, name: &str) -> PathBuf {
        self.overlay_dir(name).join("upper")
    }

    /// Kernel scratch directory.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.overlay_dir(name).join("work")
    }

    /// Overlay mount point.
    pub fn active_dir(&self, name: &str) -> PathBuf {
        self.root.join("active").join(name)
    }
}
