//! IPv4 and IPv6 stages, and the next-protocol table.

use std::sync::Arc;

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};
use tracing::trace;

use super::{esp, gre, icmp, tcp, udp, Pdu};
use crate::address::{Address, FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;
use crate::reassembly::FragmentReassembler;

/// IP protocol numbers with a decoder.
pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const GRE: u8 = 47;
    pub const ESP: u8 = 50;
}

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Dispatch on the IP version nibble.
pub fn process(engine: &Engine, parent: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    match pdu.data.first().map(|b| b >> 4) {
        Some(4) => process_ip4(engine, parent, pdu),
        Some(6) => process_ip6(engine, parent, pdu),
        Some(version) => Err(ProtocolError::InvalidField {
            protocol: "IP",
            field: "version",
            reason: format!("unsupported version {version}"),
        }
        .into()),
        None => Err(ProtocolError::too_short("IP", IPV4_MIN_HEADER, 0).into()),
    }
}

pub fn process_ip4(engine: &Engine, parent: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < IPV4_MIN_HEADER {
        return Err(ProtocolError::too_short("IPv4", IPV4_MIN_HEADER, data.len()).into());
    }

    let header = Ipv4HeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
        protocol: "IPv4",
        field: "header",
        reason: format!("{e}"),
    })?;

    let total_len = header.total_len() as usize;
    if total_len > data.len() {
        return Err(ProtocolError::Truncated {
            protocol: "IPv4",
            declared: total_len,
            captured: data.len(),
        }
        .into());
    }
    let header_len = header.slice().len();
    // Link-layer padding beyond the declared length is dropped here.
    let payload = &data[header_len..total_len];

    let addr = FlowAddress::new(
        Address::new(Purpose::Network, ProtocolTag::Ip4, &header.source()),
        Address::new(Purpose::Network, ProtocolTag::Ip4, &header.destination()),
        pdu.direction,
    );
    let config = engine.config();
    let context = parent.get_or_create(&addr, |_| {
        ContextState::Ip4(FragmentReassembler::new(config.max_fragments))
    });
    context.set_ttl(config.default_ttl);

    let id = header.identification();
    let more = header.more_fragments();
    let offset = header.fragments_offset().value() as usize * 8;

    let reassembled = {
        let mut state = context.state();
        match &mut *state {
            ContextState::Ip4(frags) if more || offset != 0 || frags.is_tracking(id) => {
                trace!(context = context.id(), ip_id = id, offset, more, "fragment");
                match frags.add(id, offset, more, &data[..header_len], payload)? {
                    Some(datagram) => Some(datagram),
                    None => return Ok(()),
                }
            }
            _ => None,
        }
    };

    match reassembled {
        // The context lock is released; start again with the whole datagram.
        Some(datagram) => process_ip4(engine, parent, pdu.with_data(&datagram)),
        None => next_protocol(engine, &context, header.protocol().0, pdu.with_data(payload)),
    }
}

pub fn process_ip6(engine: &Engine, parent: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < IPV6_HEADER {
        return Err(ProtocolError::too_short("IPv6", IPV6_HEADER, data.len()).into());
    }

    let header = Ipv6HeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
        protocol: "IPv6",
        field: "header",
        reason: format!("{e}"),
    })?;

    let declared = header.payload_length() as usize + IPV6_HEADER;
    if declared > data.len() {
        return Err(ProtocolError::Truncated {
            protocol: "IPv6",
            declared,
            captured: data.len(),
        }
        .into());
    }

    let addr = FlowAddress::new(
        Address::new(Purpose::Network, ProtocolTag::Ip6, &header.source()),
        Address::new(Purpose::Network, ProtocolTag::Ip6, &header.destination()),
        pdu.direction,
    );
    let context = parent.get_or_create(&addr, |_| ContextState::Ip6);
    context.set_ttl(engine.config().default_ttl);

    next_protocol(
        engine,
        &context,
        header.next_header().0,
        pdu.with_data(&data[IPV6_HEADER..declared]),
    )
}

/// Route an IP payload by protocol number. Unknown protocols produce an
/// event carrying the raw payload.
pub fn next_protocol(
    engine: &Engine,
    ip: &Arc<ContextNode>,
    protocol: u8,
    pdu: Pdu<'_>,
) -> Result<()> {
    match protocol {
        ip_proto::ICMP => icmp::process(engine, ip, pdu),
        ip_proto::TCP => tcp::process(engine, ip, pdu),
        ip_proto::UDP => udp::process(engine, ip, pdu),
        ip_proto::GRE => gre::process(engine, ip, pdu),
        ip_proto::ESP => esp::process(engine, ip, pdu),
        other => {
            engine.emit(
                ip,
                pdu.timestamp_us,
                EventPayload::UnrecognisedIpProtocol {
                    protocol: other,
                    data: pdu.data.to_vec(),
                },
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Direction;
    use crate::config::EngineConfig;
    use crate::context::ContextKind;
    use crate::error::Error;
    use crate::sink::VecSink;
    use crate::test_utils::{IcmpBuilder, Ipv4Builder, Ipv6Builder};

    fn setup() -> (Arc<VecSink>, Engine) {
        let sink = Arc::new(VecSink::new());
        (sink.clone(), Engine::new(EngineConfig::default(), sink))
    }

    fn handle(engine: &Engine, data: &[u8]) -> Result<()> {
        engine.handle("eth0", "net", Direction::NotKnown, 1, data)
    }

    #[test]
    fn test_too_short() {
        let (_sink, engine) = setup();
        let err = handle(&engine, &[0x45, 0, 0, 20]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::PacketTooShort { needed: 20, have: 4, .. })
        ));
    }

    #[test]
    fn test_truncated() {
        let (_sink, engine) = setup();
        let mut packet = Ipv4Builder::new().icmp().payload(vec![0; 16]).build();
        packet.truncate(30);
        let err = handle(&engine, &packet).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated { declared: 36, captured: 30, .. })
        ));
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_padding_is_trimmed() {
        let (sink, engine) = setup();
        let mut packet = Ipv4Builder::new()
            .icmp()
            .payload(IcmpBuilder::new().payload(b"ping".to_vec()).build())
            .build();
        packet.extend_from_slice(&[0xee; 6]);
        handle(&engine, &packet).unwrap();

        match &sink.payloads()[..] {
            [EventPayload::Icmp { kind: 8, code: 0, data }] => assert_eq!(data, b"ping"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_protocol_event() {
        let (sink, engine) = setup();
        let packet = Ipv4Builder::new().protocol(89).payload(vec![1, 2, 3]).build();
        handle(&engine, &packet).unwrap();
        assert_eq!(
            sink.payloads(),
            vec![EventPayload::UnrecognisedIpProtocol {
                protocol: 89,
                data: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn test_fragments_reassemble_before_dispatch() {
        let (sink, engine) = setup();
        let icmp = IcmpBuilder::new().payload((0u8..32).collect()).build();
        assert_eq!(icmp.len(), 40);

        let frag = |offset: usize, more: bool, bytes: &[u8]| {
            Ipv4Builder::new()
                .icmp()
                .identification(0x4242)
                .fragment(offset, more)
                .payload(bytes.to_vec())
                .build()
        };
        handle(&engine, &frag(16, true, &icmp[16..32])).unwrap();
        handle(&engine, &frag(32, false, &icmp[32..])).unwrap();
        assert!(sink.is_empty());
        handle(&engine, &frag(0, true, &icmp[..16])).unwrap();

        match &sink.payloads()[..] {
            [EventPayload::Icmp { kind: 8, data, .. }] => {
                assert_eq!(data, &(0u8..32).collect::<Vec<_>>())
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // A later unfragmented datagram with the same id is not held back.
        sink.take();
        handle(&engine, &Ipv4Builder::new().icmp().identification(0x4242).payload(icmp.clone()).build())
            .unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_ipv6_dispatch() {
        let (sink, engine) = setup();
        let packet = Ipv6Builder::new().next_header(89).payload(vec![9; 4]).build();
        handle(&engine, &packet).unwrap();

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].context.kind(), ContextKind::Ip6);
        assert_eq!(
            events[0].payload,
            EventPayload::UnrecognisedIpProtocol {
                protocol: 89,
                data: vec![9; 4]
            }
        );
    }

    #[test]
    fn test_ipv6_truncated() {
        let (_sink, engine) = setup();
        let mut packet = Ipv6Builder::new().payload(vec![0; 8]).build();
        packet.truncate(44);
        assert!(matches!(
            handle(&engine, &packet),
            Err(Error::Protocol(ProtocolError::Truncated { declared: 48, captured: 44, .. }))
        ));
    }
}
