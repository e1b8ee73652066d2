//! Image store daemon library.
//!
//! Ingests container-style rootfs images from remote URLs, verifies them
//! against declared sha256 checksums, expands them into a
//! content-addressed on-disk store, and exposes each image as a writable
//! overlay mount. A single background worker drives every image through a
//! durable lifecycle one step at a time until it is active or has failed.
//!
//! ## Architecture
//!
//! ```text
//! HTTP control surface (axum) ───┐
//!   submit / query / delete      ├── Catalog (SQLite, source of truth)
//! Worker (single task) ──────────┤
//!   fetch -> unpack -> activate  ├── BlobStore (content-addressed archives)
//!                                └── OverlayManager (kernel overlay mounts)
//! ```
//!
//! ## Modules
//!
//! - `lifecycle`: the state machine every image walks
//! - `catalog`: durable image rows and blob references
//! - `blobstore`: content-addressed archive cache with GC
//! - `fetcher`: streamed, retried download with on-the-fly hashing
//! - `extractor`: safe expansion of untrusted tar archives
//! - `overlay`: per-image writable views behind a mount trait
//! - `worker`: the loop that schedules transitions
//! - `api`: HTTP/JSON control surface

pub mod api;
pub mod blobstore;
pub mod catalog;
pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod layout;
pub mod lifecycle;
pub mod overlay;
pub mod worker;

pub use blobstore::BlobStore;
pub use catalog::{Catalog, CatalogError, ImageRecord};
pub use layout::StorageLayout;
pub use lifecycle::{can_transition, ImageState};
pub use overlay::{MockMounter, Mounter, OverlayManager, OverlayMounter};
pub use worker::{Worker, WorkerConfig};
