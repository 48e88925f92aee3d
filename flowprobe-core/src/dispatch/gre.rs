//! GRE stage (RFC 2784 / RFC 2890, and the enhanced PPTP variant of RFC 2637).
//!
//! Version 0 tunnels carrying IPv4 or IPv6 are decapsulated back into the
//! IP stage, with the GRE context as the parent of the inner flows. Other
//! payloads, and PPTP, produce an event.

use std::sync::Arc;

use super::{ip, read_u16, read_u32, Pdu};
use crate::address::{FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

/// GRE version numbers.
mod gre_version {
    pub const STANDARD: u8 = 0;
    pub const PPTP_ENHANCED: u8 = 1;
}

mod flag {
    pub const CHECKSUM: u16 = 0x8000;
    pub const KEY: u16 = 0x2000;
    pub const SEQUENCE: u16 = 0x1000;
    /// PPTP acknowledgment present.
    pub const ACK: u16 = 0x0080;
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

const GRE_MIN_HEADER: usize = 4;
/// Flags, protocol, payload length and call id.
const PPTP_MIN_HEADER: usize = 8;

pub fn process(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < GRE_MIN_HEADER {
        return Err(ProtocolError::too_short("GRE", GRE_MIN_HEADER, data.len()).into());
    }

    let flags = read_u16(data, 0);
    let version = (flags & 0x0007) as u8;
    match version {
        gre_version::STANDARD => process_standard(engine, ip, pdu, flags),
        gre_version::PPTP_ENHANCED => process_pptp(engine, ip, pdu, flags),
        other => Err(ProtocolError::InvalidField {
            protocol: "GRE",
            field: "version",
            reason: format!("unknown version {other}"),
        }
        .into()),
    }
}

fn context(engine: &Engine, ip: &Arc<ContextNode>, pdu: &Pdu<'_>) -> Arc<ContextNode> {
    let addr = FlowAddress::sentinel(Purpose::Transport, ProtocolTag::Gre, pdu.direction);
    let context = ip.get_or_create(&addr, |_| ContextState::Gre);
    context.set_ttl(engine.config().default_ttl);
    context
}

fn process_standard(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>, flags: u16) -> Result<()> {
    let data = pdu.data;
    let next_proto = read_u16(data, 2);

    let mut header_len = GRE_MIN_HEADER;
    if flags & flag::CHECKSUM != 0 {
        header_len += 4;
    }
    let key_at = header_len;
    if flags & flag::KEY != 0 {
        header_len += 4;
    }
    let seq_at = header_len;
    if flags & flag::SEQUENCE != 0 {
        header_len += 4;
    }
    if data.len() < header_len {
        return Err(ProtocolError::too_short("GRE", header_len, data.len()).into());
    }

    let inner = pdu.skip(header_len).decapsulated();
    let tunnelled_ip = matches!(next_proto, ETHERTYPE_IPV4 | ETHERTYPE_IPV6);
    if tunnelled_ip && inner.depth > engine.config().max_encapsulation_depth {
        return Err(ProtocolError::violation(
            "GRE",
            format!("more than {} nested tunnels", engine.config().max_encapsulation_depth),
        )
        .into());
    }

    let context = context(engine, ip, &pdu);
    match next_proto {
        ETHERTYPE_IPV4 => ip::process_ip4(engine, &context, inner),
        ETHERTYPE_IPV6 => ip::process_ip6(engine, &context, inner),
        _ => {
            let key = (flags & flag::KEY != 0).then(|| read_u32(data, key_at));
            let sequence = (flags & flag::SEQUENCE != 0).then(|| read_u32(data, seq_at));
            engine.emit(
                &context,
                pdu.timestamp_us,
                EventPayload::Gre {
                    next_proto,
                    key,
                    sequence,
                    data: inner.data.to_vec(),
                },
            );
            Ok(())
        }
    }
}

fn process_pptp(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>, flags: u16) -> Result<()> {
    let data = pdu.data;
    if data.len() < PPTP_MIN_HEADER {
        return Err(ProtocolError::too_short("GRE-PPTP", PPTP_MIN_HEADER, data.len()).into());
    }
    let call_id = read_u16(data, 6);

    let mut header_len = PPTP_MIN_HEADER;
    let seq_at = header_len;
    if flags & flag::SEQUENCE != 0 {
        header_len += 4;
    }
    let ack_at = header_len;
    if flags & flag::ACK != 0 {
        header_len += 4;
    }
    if data.len() < header_len {
        return Err(ProtocolError::too_short("GRE-PPTP", header_len, data.len()).into());
    }

    let context = context(engine, ip, &pdu);
    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::GrePptp {
            call_id,
            sequence: (flags & flag::SEQUENCE != 0).then(|| read_u32(data, seq_at)),
            ack: (flags & flag::ACK != 0).then(|| read_u32(data, ack_at)),
            data: data[header_len..].to_vec(),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Direction;
    use crate::config::EngineConfig;
    use crate::context::ContextKind;
    use crate::dispatch::ip::ip_proto;
    use crate::sink::VecSink;
    use crate::test_utils::{IcmpBuilder, Ipv4Builder};

    fn setup() -> (Arc<VecSink>, Engine) {
        let sink = Arc::new(VecSink::new());
        (sink.clone(), Engine::new(EngineConfig::default(), sink))
    }

    fn gre_packet(gre: Vec<u8>) -> Vec<u8> {
        Ipv4Builder::new().protocol(ip_proto::GRE).payload(gre).build()
    }

    #[test]
    fn test_ipv4_in_gre_is_decapsulated() {
        let (sink, engine) = setup();
        let inner = Ipv4Builder::new()
            .icmp()
            .src_ip([172, 16, 0, 1])
            .dst_ip([172, 16, 0, 2])
            .payload(IcmpBuilder::new().build())
            .build();
        let mut gre = vec![0x20, 0x00, 0x08, 0x00, 0, 0, 0, 7];
        gre.extend_from_slice(&inner);
        engine
            .handle("eth0", "net", Direction::NotKnown, 0, &gre_packet(gre))
            .unwrap();

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.name(), "icmp");
        assert_eq!(
            events[0].context.describe_src(),
            "ipv4:192.168.1.1/gre/ipv4:172.16.0.1/icmp"
        );
    }

    #[test]
    fn test_other_payload_emits_gre_event() {
        let (sink, engine) = setup();
        // Key and sequence present, transparent ethernet bridging.
        let mut gre = vec![0x30, 0x00, 0x65, 0x58];
        gre.extend_from_slice(&5u32.to_be_bytes());
        gre.extend_from_slice(&9u32.to_be_bytes());
        gre.extend_from_slice(b"frame");
        engine
            .handle("eth0", "net", Direction::NotKnown, 0, &gre_packet(gre))
            .unwrap();

        assert_eq!(
            sink.payloads(),
            vec![EventPayload::Gre {
                next_proto: 0x6558,
                key: Some(5),
                sequence: Some(9),
                data: b"frame".to_vec()
            }]
        );
    }

    #[test]
    fn test_pptp() {
        let (sink, engine) = setup();
        // K and S set, A set, version 1, PPP.
        let mut gre = vec![0x30, 0x81, 0x88, 0x0b, 0x00, 0x03, 0x12, 0x34];
        gre.extend_from_slice(&1u32.to_be_bytes());
        gre.extend_from_slice(&2u32.to_be_bytes());
        gre.extend_from_slice(b"ppp");
        engine
            .handle("eth0", "net", Direction::NotKnown, 0, &gre_packet(gre))
            .unwrap();

        let events = sink.take();
        assert_eq!(events[0].context.kind(), ContextKind::Gre);
        assert_eq!(
            events[0].payload,
            EventPayload::GrePptp {
                call_id: 0x1234,
                sequence: Some(1),
                ack: Some(2),
                data: b"ppp".to_vec()
            }
        );
    }

    /// IPv4 wrapped in `layers` GRE tunnels around an ICMP echo.
    fn nested_gre(layers: usize) -> Vec<u8> {
        let mut packet = Ipv4Builder::new().icmp().payload(IcmpBuilder::new().build()).build();
        for _ in 0..layers {
            let mut gre = vec![0x00, 0x00, 0x08, 0x00];
            gre.extend_from_slice(&packet);
            packet = gre_packet(gre);
        }
        packet
    }

    #[test]
    fn test_nesting_up_to_limit_is_decoded() {
        let sink = Arc::new(VecSink::new());
        let engine = Engine::new(EngineConfig::default().with_max_encapsulation_depth(3), sink.clone());
        engine
            .handle("eth0", "net", Direction::NotKnown, 0, &nested_gre(3))
            .unwrap();
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.name(), "icmp");
    }

    #[test]
    fn test_nesting_past_limit_is_rejected() {
        let sink = Arc::new(VecSink::new());
        let engine = Engine::new(EngineConfig::default().with_max_encapsulation_depth(3), sink.clone());
        let err = engine
            .handle("eth0", "net", Direction::NotKnown, 0, &nested_gre(4))
            .unwrap_err();
        assert!(err.is_parse_error());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let (sink, engine) = setup();
        // Each layer adds 24 bytes; stay under the 65535-byte IPv4 limit.
        let err = engine
            .handle("eth0", "net", Direction::NotKnown, 0, &nested_gre(2000))
            .unwrap_err();
        assert!(err.is_parse_error());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_bad_version() {
        let (_sink, engine) = setup();
        let gre = vec![0x00, 0x03, 0x08, 0x00];
        assert!(engine
            .handle("eth0", "net", Direction::NotKnown, 0, &gre_packet(gre))
            .is_err());
    }
}
