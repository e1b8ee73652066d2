//! Background worker that drives images through their lifecycle.
//!
//! One cooperative task processes a single image per cycle: claim an
//! eligible row, compute the successor state, run the side effect bound to
//! it, and commit the outcome. In-flight marker states (DOWNLOADING,
//! UNPACKING, ACTIVATING) are committed before their side effect starts,
//! so a crash leaves a row that restart recovery simply re-claims.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::blobstore::BlobStore;
use crate::catalog::{Catalog, CatalogError, ImageRecord};
use crate::extractor::{ExtractError, Extractor};
use crate::fetcher::{file_sha256, FetchError, Fetcher, ProgressCallback};
use crate::layout::StorageLayout;
use crate::lifecycle::{can_transition, ImageState};
use crate::overlay::{OverlayError, OverlayManager};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle delay between scheduling cycles.
    pub poll_interval: Duration,

    /// Retries after the first download attempt.
    pub max_fetch_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_fetch_retries: 3,
        }
    }
}

/// Error from a single side effect.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StepError {
    /// Cancellation is not a failure: the row is left in its in-flight
    /// state for restart recovery instead of being marked FAILED.
    fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Fetch(FetchError::Canceled) | Self::Extract(ExtractError::Canceled)
        )
    }
}

/// Single-task lifecycle worker.
pub struct Worker {
    catalog: Arc<Catalog>,
    blobs: Arc<BlobStore>,
    overlay: Arc<OverlayManager>,
    layout: StorageLayout,
    fetcher: Fetcher,
    extractor: Arc<Extractor>,
    wake: Arc<Notify>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        catalog: Arc<Catalog>,
        blobs: Arc<BlobStore>,
        overlay: Arc<OverlayManager>,
        layout: StorageLayout,
        wake: Arc<Notify>,
        config: WorkerConfig,
    ) -> Result<Self, FetchError> {
        let fetcher = Fetcher::with_retries(config.max_fetch_retries)?;

        Ok(Self {
            catalog,
            blobs,
            overlay,
            layout,
            fetcher,
            extractor: Arc::new(Extractor::new()),
            wake,
            config,
        })
    }

    /// Run the scheduling loop until shutdown. Cycles fire on the idle
    /// poll and whenever the control surface signals an enqueue; the poll
    /// also recovers rows left in in-flight states by a previous run.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting image worker"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle(&shutdown).await;
                }
                _ = self.wake.notified() => {
                    self.run_cycle(&shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Image worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process at most one image: claim, advance one transition, commit.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let image = match self.catalog.claim() {
            Ok(Some(image)) => image,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to claim an image");
                return;
            }
        };

        let next = image.state.successor();
        if !can_transition(image.state, next) {
            debug!(image = %image.name, state = %image.state, "No legal transition, skipping");
            return;
        }

        match self.execute_transition(&image, next, shutdown).await {
            Ok(()) => {
                if let Err(e) = self.catalog.set_state(image.id, next) {
                    error!(image = %image.name, error = %e, "Failed to commit state");
                } else {
                    info!(image = %image.name, from = %image.state, to = %next, "Image advanced");
                }
            }
            Err(e) if e.is_canceled() => {
                debug!(image = %image.name, state = %image.state, "Step canceled, leaving in-flight state");
            }
            Err(e) => {
                warn!(image = %image.name, from = %image.state, to = %next, error = %e, "Step failed");
                if let Err(e) = self.catalog.set_failed(image.id, &e.to_string()) {
                    error!(image = %image.name, error = %e, "Failed to record failure");
                }
            }
        }
    }

    /// The side effect bound to the target state. Marker states commit
    /// with no side effect; the real work happens on the result states.
    async fn execute_transition(
        &self,
        image: &ImageRecord,
        next: ImageState,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), StepError> {
        match next {
            ImageState::Downloading | ImageState::Unpacking | ImageState::Activating => Ok(()),
            ImageState::Stored => Ok(()),
            ImageState::Downloaded => {
                self.ensure_blob(image, shutdown).await?;
                self.blobs.mark_used(image.id, &image.checksum)?;
                Ok(())
            }
            ImageState::Unpacked => self.unpack_blob(image, shutdown).await,
            ImageState::Active => {
                self.overlay.activate(&image.name)?;
                Ok(())
            }
            ImageState::New | ImageState::Failed => Ok(()),
        }
    }

    /// Make the verified blob available, reusing an existing file when it
    /// still hashes correctly.
    async fn ensure_blob(
        &self,
        image: &ImageRecord,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), StepError> {
        let blob_path = self.layout.blob_path(&image.checksum);

        if blob_path.exists() {
            let path = blob_path.clone();
            let actual = tokio::task::spawn_blocking(move || file_sha256(&path))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

            if actual == image.checksum {
                debug!(image = %image.name, checksum = %image.checksum, "Blob already cached");
                return Ok(());
            }

            warn!(
                image = %image.name,
                expected = %image.checksum,
                actual = %actual,
                "Cached blob failed verification, refetching"
            );
        }

        let name = image.name.clone();
        let progress: ProgressCallback = Box::new(move |written, total| {
            debug!(image = %name, bytes = written, total, "Download progress");
        });

        self.fetcher
            .fetch(
                &image.blob_url,
                &blob_path,
                &image.checksum,
                shutdown,
                Some(&progress),
            )
            .await?;

        Ok(())
    }

    /// Expand the blob into a fresh image root. Any tree left behind by an
    /// interrupted earlier attempt is removed first.
    async fn unpack_blob(
        &self,
        image: &ImageRecord,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), StepError> {
        let rootfs = self.layout.image_root(&image.name);

        if rootfs.exists() {
            tokio::fs::remove_dir_all(&rootfs).await?;
        }
        tokio::fs::create_dir_all(&rootfs).await?;

        let extractor = self.extractor.clone();
        let blob_path = self.layout.blob_path(&image.checksum);
        let cancel = shutdown.clone();

        tokio::task::spawn_blocking(move || extractor.extract(&blob_path, &rootfs, &cancel))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MockMounter;
    use tempfile::TempDir;

    const CHECKSUM: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn make_worker(tmp: &TempDir) -> (Worker, Arc<Catalog>) {
        let layout = StorageLayout::new(tmp.path());
        layout.init().unwrap();
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let blobs = Arc::new(BlobStore::new(layout.clone(), catalog.clone()));
        let overlay = Arc::new(OverlayManager::new(
            layout.clone(),
            Arc::new(MockMounter::new()),
        ));

        let worker = Worker::new(
            catalog.clone(),
            blobs,
            overlay,
            layout,
            Arc::new(Notify::new()),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                max_fetch_retries: 0,
            },
        )
        .unwrap();

        (worker, catalog)
    }

    #[tokio::test]
    async fn test_cycle_with_empty_catalog_is_noop() {
        let tmp = TempDir::new().unwrap();
        let (worker, _catalog) = make_worker(&tmp);
        let (_tx, shutdown) = watch::channel(false);

        worker.run_cycle(&shutdown).await;
    }

    #[tokio::test]
    async fn test_marker_transition_commits_without_side_effect() {
        let tmp = TempDir::new().unwrap();
        let (worker, catalog) = make_worker(&tmp);
        let (_tx, shutdown) = watch::channel(false);

        catalog.enqueue("a", "http://unused/a.tar", CHECKSUM).unwrap();
        worker.run_cycle(&shutdown).await;

        let record = catalog.get("a").unwrap().unwrap();
        assert_eq!(record.state, ImageState::Downloading);
    }

    #[tokio::test]
    async fn test_failed_download_records_error() {
        let tmp = TempDir::new().unwrap();
        let (worker, catalog) = make_worker(&tmp);
        let (_tx, shutdown) = watch::channel(false);

        // Nothing is listening at this address.
        catalog
            .enqueue("a", "http://127.0.0.1:1/a.tar", CHECKSUM)
            .unwrap();

        worker.run_cycle(&shutdown).await; // NEW -> DOWNLOADING
        worker.run_cycle(&shutdown).await; // DOWNLOADING -> FAILED

        let record = catalog.get("a").unwrap().unwrap();
        assert_eq!(record.state, ImageState::Failed);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cached_blob_skips_refetch() {
        let tmp = TempDir::new().unwrap();
        let (worker, catalog) = make_worker(&tmp);
        let (_tx, shutdown) = watch::channel(false);

        // Empty file hashes to the well-known empty sha256.
        std::fs::write(tmp.path().join(format!("blobs/{CHECKSUM}.tar")), b"").unwrap();

        // The URL is unreachable; only the cache can satisfy the step.
        catalog
            .enqueue("a", "http://127.0.0.1:1/a.tar", CHECKSUM)
            .unwrap();

        worker.run_cycle(&shutdown).await; // NEW -> DOWNLOADING
        worker.run_cycle(&shutdown).await; // DOWNLOADING -> DOWNLOADED

        let record = catalog.get("a").unwrap().unwrap();
        assert_eq!(record.state, ImageState::Downloaded);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_in_flight_state() {
        let tmp = TempDir::new().unwrap();
        let (worker, catalog) = make_worker(&tmp);
        let (tx, shutdown) = watch::channel(false);

        catalog
            .enqueue("a", "http://127.0.0.1:1/a.tar", CHECKSUM)
            .unwrap();
        worker.run_cycle(&shutdown).await; // NEW -> DOWNLOADING

        tx.send(true).unwrap();
        worker.run_cycle(&shutdown).await; // must not touch the row

        let record = catalog.get("a").unwrap().unwrap();
        assert_eq!(record.state, ImageState::Downloading);
    }
}
