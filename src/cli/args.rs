//! CLI argument definitions using clap
//!
//! Commands:
//! - egm-storage init --config <path>
//! - egm-storage verify [--full] --config <path>
//! - egm-storage defrag --config <path>
//! - egm-storage clear --level <level> --config <path>
//! - egm-storage blocks --config <path>
//! - egm-storage mirror-verify --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::storage::PersistenceLevel;

/// Operator tooling for the persistent state store
#[derive(Parser, Debug)]
#[command(name = "egm-storage")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data directory and an empty store
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,
    },

    /// Run the database integrity check
    Verify {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,

        /// Check every page instead of the quick check
        #[arg(long)]
        full: bool,
    },

    /// Rebuild the database file to reclaim space
    Defrag {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,
    },

    /// Clear every block at or below a persistence level
    Clear {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,

        /// transient, static or critical
        #[arg(long)]
        level: PersistenceLevel,
    },

    /// List the block catalog
    Blocks {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,
    },

    /// Verify and repair the mirrored file set
    MirrorVerify {
        /// Path to configuration file
        #[arg(long, default_value = "./egm_storage.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
