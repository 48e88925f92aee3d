//! DNS message decoding and encoding (RFC 1035).
//!
//! Over UDP each message gets its own context, addressed by transaction id,
//! under the UDP context. Over TCP messages are length-prefixed and share one
//! stream context.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use super::app_context;
use crate::address::{Address, FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::dispatch::{read_u16, read_u32, Pdu};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

/// DNS well-known port.
pub const DNS_PORT: u16 = 53;

const PROTOCOL: &str = "DNS";
const HEADER_LEN: usize = 12;

/// Compression pointers followed while reading one name.
const MAX_POINTERS: usize = 32;
const MAX_LABELS: usize = 128;

/// DNS record types.
pub mod record_type {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const ANY: u16 = 255;
}

/// DNS response codes.
pub mod rcode {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
    pub const NOTIMP: u8 = 4;
    pub const REFUSED: u8 = 5;
}

/// Class IN.
pub const CLASS_IN: u16 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    /// Set on responses.
    pub qr: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
}

impl DnsHeader {
    fn flags(&self) -> u16 {
        (u16::from(self.qr) << 15)
            | (u16::from(self.opcode & 0x0f) << 11)
            | (u16::from(self.authoritative) << 10)
            | (u16::from(self.truncated) << 9)
            | (u16::from(self.recursion_desired) << 8)
            | (u16::from(self.recursion_available) << 7)
            | u16::from(self.rcode & 0x0f)
    }

    fn from_flags(id: u16, flags: u16) -> Self {
        Self {
            id,
            qr: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0f) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode: (flags & 0x000f) as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Resource record data, decoded for the types that carry an address or a
/// name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Address(IpAddr),
    Name(String),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    /// An A or AAAA record for `addr`.
    pub fn address(name: &str, addr: IpAddr, ttl: u32) -> Self {
        let rtype = match addr {
            IpAddr::V4(_) => record_type::A,
            IpAddr::V6(_) => record_type::AAAA,
        };
        Self {
            name: name.to_string(),
            rtype,
            class: CLASS_IN,
            ttl,
            data: RecordData::Address(addr),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub queries: Vec<DnsQuery>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

fn too_short(needed: usize, have: usize) -> ProtocolError {
    ProtocolError::too_short(PROTOCOL, needed, have)
}

/// Read a possibly compressed name starting at `offset`.
/// Returns the name and the offset just past it in the original position.
fn parse_name(msg: &[u8], offset: usize) -> std::result::Result<(String, usize), ProtocolError> {
    let mut labels: Vec<String> = Vec::with_capacity(4);
    let mut pos = offset;
    let mut end = None;
    let mut pointers = 0;

    loop {
        let len = *msg.get(pos).ok_or_else(|| too_short(pos + 1, msg.len()))? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xc0 == 0xc0 {
            let low = *msg.get(pos + 1).ok_or_else(|| too_short(pos + 2, msg.len()))? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            pointers += 1;
            if pointers > MAX_POINTERS {
                return Err(ProtocolError::violation(PROTOCOL, "compression loop"));
            }
            pos = ((len & 0x3f) << 8) | low;
            continue;
        }

        if len > 63 {
            return Err(ProtocolError::InvalidField {
                protocol: PROTOCOL,
                field: "label length",
                reason: format!("{len}"),
            });
        }
        let label = msg
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| too_short(pos + 1 + len, msg.len()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        if labels.len() > MAX_LABELS {
            return Err(ProtocolError::violation(PROTOCOL, "too many labels"));
        }
        pos += 1 + len;
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Ok((name, end.unwrap_or(pos)))
}

fn encode_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = &label.as_bytes()[..label.len().min(63)];
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    out.push(0);
}

fn parse_query(msg: &[u8], offset: usize) -> std::result::Result<(DnsQuery, usize), ProtocolError> {
    let (name, pos) = parse_name(msg, offset)?;
    if msg.len() < pos + 4 {
        return Err(too_short(pos + 4, msg.len()));
    }
    Ok((
        DnsQuery {
            name,
            qtype: read_u16(msg, pos),
            qclass: read_u16(msg, pos + 2),
        },
        pos + 4,
    ))
}

fn parse_record(msg: &[u8], offset: usize) -> std::result::Result<(DnsRecord, usize), ProtocolError> {
    let (name, pos) = parse_name(msg, offset)?;
    if msg.len() < pos + 10 {
        return Err(too_short(pos + 10, msg.len()));
    }
    let rtype = read_u16(msg, pos);
    let class = read_u16(msg, pos + 2);
    let ttl = read_u32(msg, pos + 4);
    let rdlength = read_u16(msg, pos + 8) as usize;
    let start = pos + 10;
    let rdata = msg
        .get(start..start + rdlength)
        .ok_or_else(|| too_short(start + rdlength, msg.len()))?;

    let data = match (rtype, rdlength) {
        (record_type::A, 4) => {
            RecordData::Address(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).into())
        }
        (record_type::AAAA, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            RecordData::Address(Ipv6Addr::from(octets).into())
        }
        (record_type::NS | record_type::CNAME | record_type::PTR, _) => {
            RecordData::Name(parse_name(msg, start)?.0)
        }
        _ => RecordData::Raw(rdata.to_vec()),
    };

    Ok((
        DnsRecord {
            name,
            rtype,
            class,
            ttl,
            data,
        },
        start + rdlength,
    ))
}

fn parse_records(
    msg: &[u8],
    pos: &mut usize,
    count: u16,
) -> std::result::Result<Vec<DnsRecord>, ProtocolError> {
    let mut records = Vec::with_capacity(usize::from(count).min(32));
    for _ in 0..count {
        let (record, next) = parse_record(msg, *pos)?;
        records.push(record);
        *pos = next;
    }
    Ok(records)
}

fn encode_record(record: &DnsRecord, out: &mut Vec<u8>) {
    encode_name(&record.name, out);
    out.extend_from_slice(&record.rtype.to_be_bytes());
    out.extend_from_slice(&record.class.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());
    let mut rdata = Vec::new();
    match &record.data {
        RecordData::Address(IpAddr::V4(a)) => rdata.extend_from_slice(&a.octets()),
        RecordData::Address(IpAddr::V6(a)) => rdata.extend_from_slice(&a.octets()),
        RecordData::Name(name) => encode_name(name, &mut rdata),
        RecordData::Raw(raw) => rdata.extend_from_slice(raw),
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
}

impl DnsMessage {
    pub fn parse(msg: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if msg.len() < HEADER_LEN {
            return Err(too_short(HEADER_LEN, msg.len()));
        }
        let header = DnsHeader::from_flags(read_u16(msg, 0), read_u16(msg, 2));
        let qdcount = read_u16(msg, 4);
        let ancount = read_u16(msg, 6);
        let nscount = read_u16(msg, 8);
        let arcount = read_u16(msg, 10);

        let mut pos = HEADER_LEN;
        let mut queries = Vec::with_capacity(usize::from(qdcount).min(8));
        for _ in 0..qdcount {
            let (query, next) = parse_query(msg, pos)?;
            queries.push(query);
            pos = next;
        }
        let answers = parse_records(msg, &mut pos, ancount)?;
        let authorities = parse_records(msg, &mut pos, nscount)?;
        let additional = parse_records(msg, &mut pos, arcount)?;

        Ok(Self {
            header,
            queries,
            answers,
            authorities,
            additional,
        })
    }

    /// Wire form, without name compression.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.header.id.to_be_bytes());
        out.extend_from_slice(&self.header.flags().to_be_bytes());
        for count in [
            self.queries.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additional.len(),
        ] {
            out.extend_from_slice(&(count as u16).to_be_bytes());
        }
        for query in &self.queries {
            encode_name(&query.name, &mut out);
            out.extend_from_slice(&query.qtype.to_be_bytes());
            out.extend_from_slice(&query.qclass.to_be_bytes());
        }
        for record in self.answers.iter().chain(&self.authorities).chain(&self.additional) {
            encode_record(record, &mut out);
        }
        out
    }

    /// A response to this query carrying `answers`.
    pub fn answer(&self, answers: Vec<DnsRecord>) -> Self {
        Self {
            header: DnsHeader {
                qr: true,
                authoritative: true,
                recursion_available: self.header.recursion_desired,
                rcode: rcode::NOERROR,
                ..self.header.clone()
            },
            queries: self.queries.clone(),
            answers,
            authorities: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// One message per datagram.
pub fn process_udp(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let message = DnsMessage::parse(pdu.data)?;

    let id = message.header.id.to_be_bytes();
    let endpoint = Address::new(Purpose::Application, ProtocolTag::Dns, &id);
    let addr = FlowAddress::new(endpoint.clone(), endpoint, pdu.direction);
    let context = transport.get_or_create(&addr, |_| ContextState::Dns);

    engine.emit(&context, pdu.timestamp_us, EventPayload::DnsMessage(message));
    Ok(())
}

/// Two-byte length-prefixed messages on a stream (RFC 1035 4.2.2).
pub fn process_tcp(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Dns, pdu.direction, || {
        ContextState::DnsStream { buffer: Vec::new() }
    });

    let mut events = Vec::new();
    let result = match &mut *context.state() {
        ContextState::DnsStream { buffer } => split_messages(buffer, pdu.data, &mut events),
        _ => Ok(()),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}

fn split_messages(
    buffer: &mut Vec<u8>,
    data: &[u8],
    events: &mut Vec<EventPayload>,
) -> std::result::Result<(), ProtocolError> {
    buffer.extend_from_slice(data);
    let mut pos = 0;
    while buffer.len() >= pos + 2 {
        let len = read_u16(buffer, pos) as usize;
        if buffer.len() < pos + 2 + len {
            break;
        }
        let message = DnsMessage::parse(&buffer[pos + 2..pos + 2 + len]);
        pos += 2 + len;
        match message {
            Ok(message) => events.push(EventPayload::DnsMessage(message)),
            Err(e) => {
                buffer.drain(..pos);
                return Err(e);
            }
        }
    }
    buffer.drain(..pos);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: u16, name: &str) -> DnsMessage {
        DnsMessage {
            header: DnsHeader {
                id,
                recursion_desired: true,
                ..Default::default()
            },
            queries: vec![DnsQuery {
                name: name.to_string(),
                qtype: record_type::A,
                qclass: CLASS_IN,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_query() {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
        ]);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let msg = DnsMessage::parse(&packet).unwrap();
        assert_eq!(msg.header.id, 0x1234);
        assert!(!msg.header.qr);
        assert!(msg.header.recursion_desired);
        assert_eq!(msg, query(0x1234, "example.com"));
        assert_eq!(msg.encode(), packet);
    }

    #[test]
    fn test_compressed_answer() {
        let mut packet = vec![0xab, 0xcd, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0];
        // Question at offset 12.
        packet.extend_from_slice(&[3, b'w', b'w', b'w', 7]);
        packet.extend_from_slice(b"example");
        packet.extend_from_slice(&[3, b'c', b'o', b'm', 0, 0, 5, 0, 1]);
        // CNAME www.example.com -> web.example.com (pointer into question)
        packet.extend_from_slice(&[0xc0, 12, 0, 5, 0, 1, 0, 0, 0, 60, 0, 6, 3, b'w', b'e', b'b', 0xc0, 16]);
        // A web.example.com
        let web = 12 + 21 + 12;
        packet.extend_from_slice(&[0xc0, web as u8, 0, 1, 0, 1, 0, 0, 1, 0, 0, 4, 93, 184, 216, 34]);

        let msg = DnsMessage::parse(&packet).unwrap();
        assert!(msg.header.qr);
        assert_eq!(msg.queries[0].name, "www.example.com");
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].data, RecordData::Name("web.example.com".into()));
        assert_eq!(msg.answers[1].name, "web.example.com");
        assert_eq!(
            msg.answers[1].data,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert_eq!(msg.answers[1].ttl, 256);
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1]);
        assert!(DnsMessage::parse(&packet).is_err());
    }

    #[test]
    fn test_truncated_record() {
        let mut packet = query(1, "a.b").answer(vec![]).encode();
        packet[7] = 1;
        assert!(matches!(
            DnsMessage::parse(&packet),
            Err(ProtocolError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn test_answer_encode_parse() {
        let q = query(7, "host.example");
        let reply = q.answer(vec![DnsRecord::address(
            "host.example",
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            30,
        )]);
        let parsed = DnsMessage::parse(&reply.encode()).unwrap();
        assert!(parsed.header.qr);
        assert!(parsed.header.recursion_available);
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_tcp_framing() {
        let a = query(1, "a.example").encode();
        let b = query(2, "b.example").encode();
        let mut stream = Vec::new();
        for m in [&a, &b] {
            stream.extend_from_slice(&(m.len() as u16).to_be_bytes());
            stream.extend_from_slice(m);
        }

        let mut buffer = Vec::new();
        let mut events = Vec::new();
        let split = a.len() + 5;
        split_messages(&mut buffer, &stream[..split], &mut events).unwrap();
        assert_eq!(events.len(), 1);
        split_messages(&mut buffer, &stream[split..], &mut events).unwrap();
        assert_eq!(events.len(), 2);
        assert!(buffer.is_empty());
        assert!(matches!(&events[1], EventPayload::DnsMessage(m) if m.header.id == 2));
    }
}
