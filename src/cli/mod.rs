//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Event formatting (one line per event, optional hex dump)

mod args;
mod output;

pub use args::Args;
pub use output::{consume, EventFormatter, OutputFormat};
