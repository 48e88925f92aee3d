//! Command-line argument definitions.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use super::OutputFormat;

/// Replay capture files through the flow-context engine and print the
/// protocol events it produces.
#[derive(Parser, Debug)]
#[command(name = "flowprobe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// PCAP / PCAPNG files to replay, optionally gzipped
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Device name recorded on the root context
    #[arg(long = "device", default_value = "pcap")]
    pub device: String,

    /// Network name recorded on the root context
    #[arg(long = "network", default_value = "default")]
    pub network: String,

    /// Monitored address, used to tell packets to and from the target apart
    #[arg(long = "target", value_name = "IP")]
    pub target: Option<IpAddr>,

    /// Output format for events
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Capacity of the event queue between capture and output
    #[arg(long = "queue-capacity", default_value = "1000")]
    pub queue_capacity: usize,

    /// Idle lifetime of a flow context in seconds
    #[arg(long = "ttl", default_value = "120")]
    pub ttl: u64,

    /// Do not run the background reaper
    #[arg(long = "no-reaper")]
    pub no_reaper: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Log filter chosen by the number of `-v` flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
