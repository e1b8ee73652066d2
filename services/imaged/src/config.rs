//! Daemon configuration.
//!
//! All configuration comes from CLI flags; no environment variables are
//! required.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Image store daemon: ingests rootfs images and exposes them as writable
/// overlay mounts.
#[derive(Debug, Parser)]
#[command(name = "imgstored", version, about)]
pub struct Config {
    /// SQLite database path.
    #[arg(long = "db", value_name = "PATH", default_value = "./store.db")]
    pub db_path: PathBuf,

    /// Storage root path.
    #[arg(long = "store", value_name = "PATH", default_value = "./store")]
    pub store_root: PathBuf,

    /// HTTP listen address.
    #[arg(long = "addr", value_name = "ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: SocketAddr,
}
