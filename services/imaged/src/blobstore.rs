//! Content-addressed blob store.
//!
//! Archives live at `<root>/blobs/<checksum>.tar`; the catalog's `blobs`
//! table links each file to the images that requested it. A blob shared by
//! several images is stored once and survives until no non-FAILED image
//! references it.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogError};
use crate::layout::StorageLayout;

/// Whether a string is a well-formed blob checksum: exactly 64 lowercase
/// hex characters.
pub fn is_valid_checksum(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Content-addressed archive cache backed by the catalog.
pub struct BlobStore {
    layout: StorageLayout,
    catalog: Arc<Catalog>,
}

impl BlobStore {
    pub fn new(layout: StorageLayout, catalog: Arc<Catalog>) -> Self {
        Self { layout, catalog }
    }

    /// Filesystem path for a checksum.
    pub fn path(&self, checksum: &str) -> PathBuf {
        self.layout.blob_path(checksum)
    }

    /// Whether the blob file exists on disk.
    pub fn exists(&self, checksum: &str) -> bool {
        self.path(checksum).exists()
    }

    /// Record that an image references a blob. Idempotent on duplicate
    /// (image, checksum) pairs.
    pub fn mark_used(&self, image_id: i64, checksum: &str) -> Result<(), CatalogError> {
        let path = self.path(checksum);
        self.catalog
            .mark_blob_used(image_id, &path.to_string_lossy(), checksum)
    }

    /// Checksums no longer referenced by any non-FAILED image.
    pub fn unused(&self) -> Result<Vec<String>, CatalogError> {
        self.catalog.unused_blob_checksums()
    }

    /// Remove every unused blob: the file first, then the catalog rows.
    /// A file that cannot be removed is logged and its rows are removed
    /// anyway; the file is already orphaned. Returns the number of
    /// checksums swept.
    pub fn cleanup(&self) -> Result<usize, CatalogError> {
        let unused = self.unused()?;

        for checksum in &unused {
            let path = self.path(checksum);
            match std::fs::remove_file(&path) {
                Ok(()) => info!(checksum = %checksum, "Removed unused blob"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(checksum = %checksum, path = %path.display(), error = %e,
                        "Failed to remove blob file");
                }
            }
            self.catalog.delete_blob_rows(checksum)?;
        }

        Ok(unused.len())
    }
}
