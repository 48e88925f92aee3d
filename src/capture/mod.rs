//! Capture file replay.
//!
//! Reads PCAP / PCAPNG files (optionally gzipped), strips the link layer and
//! feeds each IP packet to [`Engine::handle`]. Per-packet failures are logged
//! and counted; only file-level problems abort a replay.

pub mod link;
mod pcap;

use std::net::IpAddr;
use std::path::Path;

use flowprobe_core::{Address, Engine, ProtocolTag, Purpose};
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};

pub use pcap::{is_gzip_extension, PcapReader};

/// A raw frame from a capture file.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Frame number (1-indexed).
    pub frame_number: u64,

    /// Timestamp in microseconds since epoch.
    pub timestamp_us: i64,

    /// Captured length (may be less than original).
    pub captured_length: u32,

    /// Original length on the wire.
    pub original_length: u32,

    /// Link layer type (e.g., 1 = Ethernet).
    pub link_type: u16,

    pub data: Vec<u8>,
}

impl RawPacket {
    pub fn new(
        frame_number: u64,
        timestamp_us: i64,
        captured_length: u32,
        original_length: u32,
        link_type: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            frame_number,
            timestamp_us,
            captured_length,
            original_length,
            link_type,
            data,
        }
    }

    /// Check if the packet was truncated during capture.
    pub fn is_truncated(&self) -> bool {
        self.captured_length < self.original_length
    }
}

/// Where replayed packets are attributed.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub device: String,
    pub network: String,
    /// Monitored address; packets to it are `ToTarget`, from it `FromTarget`.
    pub target: Option<IpAddr>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            device: "pcap".to_string(),
            network: "default".to_string(),
            target: None,
        }
    }
}

/// Counters for one replayed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    /// Frames handed to the engine without error.
    pub dispatched: u64,
    /// Frames carrying something other than IP.
    pub skipped: u64,
    /// Frames the engine or the link layer rejected.
    pub errors: u64,
}

impl ReplayStats {
    pub fn merge(&mut self, other: ReplayStats) {
        self.frames += other.frames;
        self.dispatched += other.dispatched;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// The engine address for a target IP.
pub fn target_address(ip: IpAddr) -> Address {
    match ip {
        IpAddr::V4(v4) => Address::new(Purpose::Network, ProtocolTag::Ip4, &v4.octets()),
        IpAddr::V6(v6) => Address::new(Purpose::Network, ProtocolTag::Ip6, &v6.octets()),
    }
}

/// Replay one capture file through `engine`.
pub fn replay<P: AsRef<Path>>(
    engine: &Engine,
    path: P,
    options: &ReplayOptions,
) -> Result<ReplayStats> {
    let path = path.as_ref();
    let reader = PcapReader::open(path)?;
    info!(file = %path.display(), "replaying capture");

    if let Some(target) = options.target {
        engine.set_target(&options.device, &options.network, target_address(target));
    }

    let mut stats = ReplayStats::default();
    for packet in reader {
        let packet = packet?;
        stats.frames += 1;

        let ip = match link::ip_payload(packet.link_type, &packet.data) {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                stats.skipped += 1;
                continue;
            }
            Err(e @ CaptureError::UnsupportedLinkType { .. }) => return Err(e.into()),
            Err(e) => {
                warn!(frame = packet.frame_number, error = %e, "frame dropped");
                stats.errors += 1;
                continue;
            }
        };

        let direction = link::infer_direction(ip, options.target);
        match engine.handle(
            &options.device,
            &options.network,
            direction,
            packet.timestamp_us,
            ip,
        ) {
            Ok(()) => stats.dispatched += 1,
            Err(e) if e.is_parse_error() => {
                debug!(frame = packet.frame_number, error = %e, "packet not decoded");
                stats.errors += 1;
            }
            Err(e) => {
                warn!(frame = packet.frame_number, error = %e, "packet dropped");
                stats.errors += 1;
            }
        }
    }

    info!(
        file = %path.display(),
        frames = stats.frames,
        errors = stats.errors,
        "capture replayed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_packet() {
        let packet = RawPacket::new(1, 0, 64, 1500, 1, vec![0; 64]);
        assert!(packet.is_truncated());
    }

    #[test]
    fn test_target_address() {
        let addr = target_address("192.0.2.7".parse().unwrap());
        assert_eq!(addr.protocol, ProtocolTag::Ip4);
        assert_eq!(addr.to_string(), "192.0.2.7");
    }

    #[test]
    fn test_stats_merge() {
        let mut total = ReplayStats {
            frames: 2,
            dispatched: 1,
            skipped: 1,
            errors: 0,
        };
        total.merge(ReplayStats {
            frames: 3,
            dispatched: 2,
            skipped: 0,
            errors: 1,
        });
        assert_eq!(total.frames, 5);
        assert_eq!(total.errors, 1);
    }
}
