//! Command line arguments.

use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Top-level arguments. Flags other than the subcommand are global and
/// override values from the config file.
#[derive(Debug, Parser)]
#[command(
    name = "pictor",
    version,
    about = "Fetch remote images through a transform-aware memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "DIR", env = "PICTOR_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum decoded images kept in memory.
    #[arg(long, global = true)]
    pub memory_capacity: Option<usize>,

    /// Maximum fetches resolving at once.
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Network timeout in seconds.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch images through the cache and report where each came from.
    Fetch {
        /// Image URLs.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Transform: identity, grayscale, circle, blur:R, corners:R or corners:TL,TR,BL,BR.
        #[arg(short, long, default_value = "identity")]
        transform: String,

        /// Skip cached entries and download again.
        #[arg(long)]
        refresh: bool,

        /// Neither read nor write the disk cache.
        #[arg(long)]
        no_disk_cache: bool,

        /// Save each transformed image as PNG into this directory.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Print one JSON object per result.
        #[arg(long)]
        json: bool,
    },

    /// Print the cache key and disk location for a URL.
    Key {
        /// Image URL.
        url: String,

        /// Transform, as for `fetch`.
        #[arg(short, long, default_value = "identity")]
        transform: String,
    },

    /// Remove every entry from the disk cache.
    Clear,
}
