//! imgctl - image store CLI.
//!
//! Operates directly on the catalog and storage root; the daemon does not
//! need to be running for `fetch` and `status`, and `worker` runs the
//! ingestion loop in the foreground.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::{watch, Notify};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imgstore_daemon::blobstore::is_valid_checksum;
use imgstore_daemon::{
    BlobStore, Catalog, OverlayManager, OverlayMounter, StorageLayout, Worker, WorkerConfig,
};

/// Image store CLI - enqueue images and run the ingestion worker.
#[derive(Debug, Parser)]
#[command(name = "imgctl", version, about)]
struct Cli {
    /// SQLite database path.
    #[arg(long = "db", global = true, value_name = "PATH", default_value = "./store.db")]
    db_path: PathBuf,

    /// Storage root path.
    #[arg(long = "store", global = true, value_name = "PATH", default_value = "./store")]
    store_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enqueue an image for ingestion.
    Fetch {
        /// Unique image name.
        name: String,
        /// Blob URL to fetch the archive from.
        url: String,
        /// Expected sha256 of the archive (lowercase hex).
        checksum: String,
    },

    /// Print the current state of an image.
    Status {
        /// Image name.
        name: String,
    },

    /// Run the ingestion worker in the foreground.
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let catalog = Arc::new(Catalog::open(&cli.db_path)?);
    let layout = StorageLayout::new(&cli.store_root);
    layout.init()?;

    match cli.command {
        Commands::Fetch {
            name,
            url,
            checksum,
        } => {
            if !is_valid_checksum(&checksum) {
                anyhow::bail!("checksum must be 64 lowercase hex characters");
            }
            catalog.enqueue(&name, &url, &checksum)?;
            println!("Enqueued image {name}");
        }

        Commands::Status { name } => match catalog.get(&name)? {
            Some(record) => println!("Image {}: {}", record.name, record.state),
            None => anyhow::bail!("image not found: {name}"),
        },

        Commands::Worker => {
            let blobs = Arc::new(BlobStore::new(layout.clone(), catalog.clone()));
            let overlay = Arc::new(OverlayManager::new(
                layout.clone(),
                Arc::new(OverlayMounter),
            ));

            let worker = Worker::new(
                catalog,
                blobs,
                overlay,
                layout,
                Arc::new(Notify::new()),
                WorkerConfig::default(),
            )?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

            info!("Worker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
    }

    Ok(())
}
