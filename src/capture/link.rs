//! Link-layer decapsulation and direction inference.
//!
//! The engine takes bare IP packets. Frames are stripped of their link
//! header here, and anything that does not carry IPv4 or IPv6 is skipped.

use std::net::IpAddr;

use etherparse::{EtherType, Ethernet2Header, Ipv4HeaderSlice, Ipv6HeaderSlice, SingleVlanHeader};
use flowprobe_core::Direction;

use crate::error::CaptureError;

pub const LINKTYPE_ETHERNET: u16 = 1;
pub const LINKTYPE_RAW: u16 = 101;
pub const LINKTYPE_LINUX_SLL: u16 = 113;
pub const LINKTYPE_IPV4: u16 = 228;
pub const LINKTYPE_IPV6: u16 = 229;

/// Linux cooked capture header length.
const SLL_HEADER_LEN: usize = 16;

fn truncated(link_type: u16, needed: usize, have: usize) -> CaptureError {
    CaptureError::TruncatedFrame {
        link_type,
        needed,
        have,
    }
}

fn is_ip(ether_type: EtherType) -> bool {
    ether_type == EtherType::IPV4 || ether_type == EtherType::IPV6
}

/// The IP packet inside a captured frame.
///
/// Returns `Ok(None)` for frames that carry something other than IP
/// (ARP, LLDP and friends).
pub fn ip_payload(link_type: u16, frame: &[u8]) -> Result<Option<&[u8]>, CaptureError> {
    match link_type {
        LINKTYPE_ETHERNET => ethernet_payload(frame),
        LINKTYPE_LINUX_SLL => {
            if frame.len() < SLL_HEADER_LEN {
                return Err(truncated(link_type, SLL_HEADER_LEN, frame.len()));
            }
            let protocol = EtherType(u16::from_be_bytes([frame[14], frame[15]]));
            Ok(is_ip(protocol).then_some(&frame[SLL_HEADER_LEN..]))
        }
        LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => Ok(Some(frame)),
        other => Err(CaptureError::UnsupportedLinkType { link_type: other }),
    }
}

fn ethernet_payload(frame: &[u8]) -> Result<Option<&[u8]>, CaptureError> {
    let (header, mut rest) = Ethernet2Header::from_slice(frame)
        .map_err(|e| truncated(LINKTYPE_ETHERNET, e.required_len, e.len))?;
    let mut ether_type = header.ether_type;

    // 802.1Q and 802.1ad tags, possibly stacked.
    while matches!(
        ether_type,
        EtherType::VLAN_TAGGED_FRAME | EtherType::PROVIDER_BRIDGING | EtherType::VLAN_DOUBLE_TAGGED_FRAME
    ) {
        let (vlan, inner) = SingleVlanHeader::from_slice(rest).map_err(|e| {
            truncated(
                LINKTYPE_ETHERNET,
                frame.len() - rest.len() + e.required_len,
                frame.len(),
            )
        })?;
        ether_type = vlan.ether_type;
        rest = inner;
    }

    Ok(is_ip(ether_type).then_some(rest))
}

/// Source and destination of an IP packet.
pub fn ip_endpoints(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match packet.first()? >> 4 {
        4 => {
            let header = Ipv4HeaderSlice::from_slice(packet).ok()?;
            Some((header.source_addr().into(), header.destination_addr().into()))
        }
        6 => {
            let header = Ipv6HeaderSlice::from_slice(packet).ok()?;
            Some((header.source_addr().into(), header.destination_addr().into()))
        }
        _ => None,
    }
}

/// Which way a packet travelled relative to the monitored target.
pub fn infer_direction(packet: &[u8], target: Option<IpAddr>) -> Direction {
    let Some(target) = target else {
        return Direction::NotKnown;
    };
    match ip_endpoints(packet) {
        Some((_, dst)) if dst == target => Direction::ToTarget,
        Some((src, _)) if src == target => Direction::FromTarget,
        _ => Direction::NotKnown,
    }
}
