//! TCP stage: connection tracking, segment reassembly and application
//! protocol identification.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use etherparse::TcpHeaderSlice;
use regex::bytes::Regex;
use tracing::debug;

use super::ports::handlers;
use super::{Handler, Pdu};
use crate::address::{Address, FlowAddress, ProtocolTag};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;
use crate::reassembly::{SegmentReassembler, TcpFlags};

const TCP_MIN_HEADER: usize = 20;

/// State of one direction of a TCP connection.
#[derive(Debug)]
pub struct TcpState {
    pub stream: SegmentReassembler,
    ident: Vec<u8>,
    handler: Option<Handler>,
}

impl TcpState {
    pub fn new(max_segments: usize) -> Self {
        Self {
            stream: SegmentReassembler::new(max_segments),
            ident: Vec::new(),
            handler: None,
        }
    }

    /// The decoder bound to this stream, once identified.
    pub fn handler(&self) -> Option<Handler> {
        self.handler
    }
}

pub fn process(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < TCP_MIN_HEADER {
        return Err(ProtocolError::too_short("TCP", TCP_MIN_HEADER, data.len()).into());
    }
    let header = TcpHeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
        protocol: "TCP",
        field: "header",
        reason: format!("{e}"),
    })?;
    let payload = &data[header.slice().len()..];

    let addr = FlowAddress::new(
        Address::port(ProtocolTag::Tcp, header.source_port()),
        Address::port(ProtocolTag::Tcp, header.destination_port()),
        pdu.direction,
    );
    let config = engine.config();
    let context = ip.get_or_create(&addr, |_| {
        ContextState::Tcp(Box::new(TcpState::new(config.max_segments)))
    });

    let flags = TcpFlags {
        syn: header.syn(),
        ack: header.ack(),
        fin: header.fin(),
        rst: header.rst(),
    };

    let (outcome, closing) = {
        let mut state = context.state();
        let ContextState::Tcp(tcp) = &mut *state else {
            return Ok(());
        };
        let outcome = tcp.stream.process(
            header.sequence_number(),
            header.acknowledgment_number(),
            flags,
            payload,
        );
        (outcome, tcp.stream.fin_observed())
    };

    if outcome.connection_down {
        context.set_ttl(config.close_ttl);
    } else if !closing {
        context.set_ttl(config.default_ttl);
    }

    if outcome.connection_up {
        engine.emit(&context, pdu.timestamp_us, EventPayload::ConnectionUp);
    }
    if outcome.connection_down {
        engine.emit(&context, pdu.timestamp_us, EventPayload::ConnectionDown);
    }

    for chunk in &outcome.chunks {
        post_process(engine, &context, pdu.with_data(chunk))?;
    }
    Ok(())
}

/// Hand in-order stream bytes to the application decoder, identifying it
/// first if needed.
///
/// Identification tries the port table (source port first), then buffers
/// the stream until `ident_threshold` bytes are available and sniffs them.
pub fn post_process(engine: &Engine, context: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let (handler, data) = {
        let mut state = context.state();
        let ContextState::Tcp(tcp) = &mut *state else {
            return Ok(());
        };

        match tcp.handler {
            Some(handler) => (handler, Cow::Borrowed(pdu.data)),
            None => {
                let addr = context.addr();
                let src = addr.src.as_u16().unwrap_or_default();
                let dest = addr.dest.as_u16().unwrap_or_default();
                if let Some(handler) = engine.tcp_ports().lookup(src, dest) {
                    debug!(context = context.id(), src, dest, handler = handler.name, "tcp service by port");
                    tcp.handler = Some(handler);
                    (handler, Cow::Borrowed(pdu.data))
                } else {
                    tcp.ident.extend_from_slice(pdu.data);
                    if tcp.ident.len() < engine.config().ident_threshold {
                        return Ok(());
                    }
                    let handler = identify(&tcp.ident);
                    debug!(context = context.id(), handler = handler.name, "tcp service by content");
                    tcp.handler = Some(handler);
                    (handler, Cow::Owned(std::mem::take(&mut tcp.ident)))
                }
            }
        }
    };

    let result = handler.call(engine, context, pdu.with_data(&data));
    if let Err(e) = &result {
        if e.is_parse_error() {
            debug!(context = context.id(), handler = handler.name, error = %e, "decoder failed, stream now unrecognised");
            fall_back(context);
        }
    }
    result
}

/// Rebind a stream whose decoder gave up to the unrecognised-stream decoder.
pub fn fall_back(context: &Arc<ContextNode>) {
    rebind(context, handlers::UNRECOGNISED_STREAM);
}

/// Replace the decoder bound to a TCP context. Other kinds are ignored.
pub fn rebind(context: &Arc<ContextNode>, handler: Handler) {
    if let ContextState::Tcp(tcp) = &mut *context.state() {
        tcp.ident.clear();
        tcp.handler = Some(handler);
    }
}

fn http_request_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    // The ident buffer may end inside the version token.
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?:OPTIONS|GET|HEAD|POST|PUT|DELETE|CONNECT|TRACE|PATCH) [^ \r\n]*(?: HTTP/1\.|(?: (?:H(?:T(?:T(?:P(?:/(?:1)?)?)?)?)?)?)?$)",
            )
            .ok()
        })
        .as_ref()
}

fn http_response_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^HTTP/1\.").ok()).as_ref()
}

fn is_match(pattern: Option<&Regex>, data: &[u8]) -> bool {
    pattern.is_some_and(|re| re.is_match(data))
}

/// Pick a decoder from the first bytes of a stream.
pub fn identify(data: &[u8]) -> Handler {
    if is_match(http_request_pattern(), data) {
        handlers::HTTP_REQUEST
    } else if is_match(http_response_pattern(), data) {
        handlers::HTTP_RESPONSE
    } else {
        handlers::UNRECOGNISED_STREAM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Direction;
    use crate::config::EngineConfig;
    use crate::context::ContextKind;
    use crate::reaper::ManualClock;
    use crate::sink::VecSink;
    use crate::test_utils::{Ipv4Builder, TcpBuilder};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn setup() -> (Arc<VecSink>, Engine) {
        let sink = Arc::new(VecSink::new());
        let clock = Arc::new(ManualClock::new(1000));
        let engine = Engine::with_clock(EngineConfig::default(), sink.clone(), clock);
        (sink, engine)
    }

    fn send(engine: &Engine, from_client: bool, tcp: TcpBuilder) {
        let (src, dst) = if from_client { (CLIENT, SERVER) } else { (SERVER, CLIENT) };
        let packet = Ipv4Builder::new().tcp().src_ip(src).dst_ip(dst).payload(tcp.build()).build();
        engine.handle("eth0", "net", Direction::NotKnown, 0, &packet).unwrap();
    }

    fn client(seq: u32) -> TcpBuilder {
        TcpBuilder::new().src_port(40000).dst_port(9999).seq(seq)
    }

    fn server(seq: u32) -> TcpBuilder {
        TcpBuilder::new().src_port(9999).dst_port(40000).seq(seq)
    }

    #[test]
    fn test_identify() {
        assert_eq!(identify(b"GET /index.html HTTP").name, "http_request");
        assert_eq!(identify(b"GET /index.html HTTP/1.1\r\n").name, "http_request");
        assert_eq!(identify(b"POST /a/very/long/path/that/never/ends").name, "http_request");
        assert_eq!(identify(b"HTTP/1.1 200 OK\r\nCon").name, "http_response");
        assert_eq!(identify(b"SSH-2.0-OpenSSH_9.6\r\n").name, "unrecognised_stream");
        assert_eq!(identify(b"GET  HTTP/2.0 x").name, "unrecognised_stream");
    }

    // Test 1: Handshake, data and close produce connection events once each
    #[test]
    fn test_connection_lifecycle() {
        let (sink, engine) = setup();
        send(&engine, true, client(100).syn());
        send(&engine, false, server(500).syn_ack().ack_num(101));
        send(&engine, true, client(101).ack().ack_num(501));
        send(&engine, true, client(101).psh_ack().payload(b"0123456789abcdefghijKLMN".to_vec()));
        send(&engine, true, client(125).flags(0x11));
        send(&engine, true, client(125).flags(0x11));

        let names: Vec<_> = sink.payloads().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["connection_up", "unrecognised_stream", "connection_down"]
        );
    }

    // Test 2: Small writes are buffered until the ident threshold
    #[test]
    fn test_ident_buffering() {
        let (sink, engine) = setup();
        send(&engine, true, client(100).syn());
        send(&engine, true, client(101).psh_ack().payload(b"HTTP/1.1 2".to_vec()));
        assert!(sink.payloads().iter().all(|p| p.name() == "connection_up"));

        send(&engine, true, client(111).psh_ack().payload(b"04 No Content\r\n\r\n".to_vec()));
        let events = sink.take();
        let last = events.last().unwrap();
        assert!(matches!(last.payload, EventPayload::HttpResponse { code: 204, .. }));
        assert_eq!(last.context.kind(), ContextKind::HttpResponse);
    }

    // Test 3: Port table takes precedence over sniffing
    #[test]
    fn test_port_binding() {
        let (sink, engine) = setup();
        let smtp = |seq| TcpBuilder::new().src_port(40000).dst_port(25).seq(seq);
        send(&engine, true, smtp(1).syn());
        send(&engine, true, smtp(2).psh_ack().payload(b"HELO a\r\n".to_vec()));
        assert!(sink
            .payloads()
            .contains(&EventPayload::SmtpCommand { command: "HELO a".to_string() }));
    }

    // Test 4: FIN shortens the TTL and later packets do not re-arm it
    #[test]
    fn test_fin_sets_close_ttl() {
        let (_sink, engine) = setup();
        send(&engine, true, client(100).syn());
        send(&engine, true, client(101).flags(0x11));
        send(&engine, true, client(101).ack());

        let root = engine.get_root_context("eth0", "net");
        let ip = root.children().pop().unwrap();
        let tcp = ip.children().pop().unwrap();
        let reaper = engine.arena().reaper();
        assert_eq!(
            reaper.expiry(tcp.id()),
            Some(reaper.now() + engine.config().close_ttl)
        );
    }
}
