//! CLI module for egm-storage
//!
//! Operator commands over a stopped machine's store:
//! - init: create the data directory and an empty store
//! - verify: integrity check
//! - defrag: rebuild the database file
//! - clear: persistence clear at a level
//! - blocks: list the block catalog
//! - mirror-verify: verify and repair the mirror

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{blocks, clear, defrag, init, mirror_verify, run_command, verify};
pub use errors::{CliError, CliResult};
pub use io::{write_error, write_response};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    run_command(Cli::parse_args().command)
}
