//! End-to-end tests: packets built with etherparse go through
//! `Engine::handle` and come out as events.

use std::sync::Arc;

use etherparse::PacketBuilder;
use flowprobe_core::context::{ContextKind, ContextState};
use flowprobe_core::dispatch::ports::handlers;
use flowprobe_core::{Direction, Engine, EngineConfig, EventPayload, ManualClock, QueueSink, Result, VecSink};

const CLIENT: [u8; 4] = [10, 1, 0, 5];
const SERVER: [u8; 4] = [93, 184, 216, 34];
const CLIENT_PORT: u16 = 51000;

fn setup() -> (Arc<VecSink>, Engine) {
    let sink = Arc::new(VecSink::new());
    (sink.clone(), Engine::new(EngineConfig::default(), sink))
}

/// One side of a TCP connection, tracking its own sequence number.
struct Peer {
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
}

impl Peer {
    fn client(server_port: u16) -> Self {
        Self {
            src: CLIENT,
            dst: SERVER,
            src_port: CLIENT_PORT,
            dst_port: server_port,
            seq: 1000,
        }
    }

    fn server(server_port: u16) -> Self {
        Self {
            src: SERVER,
            dst: CLIENT,
            src_port: server_port,
            dst_port: CLIENT_PORT,
            seq: 9000,
        }
    }

    fn syn(&mut self, engine: &Engine) {
        let builder = PacketBuilder::ipv4(self.src, self.dst, 64)
            .tcp(self.src_port, self.dst_port, self.seq, 65535)
            .syn();
        let mut packet = Vec::with_capacity(builder.size(0));
        builder.write(&mut packet, &[]).unwrap();
        self.seq += 1;
        engine.handle("eth0", "lab", Direction::NotKnown, 0, &packet).unwrap();
    }

    fn send(&mut self, engine: &Engine, payload: &[u8]) -> Result<()> {
        let builder = PacketBuilder::ipv4(self.src, self.dst, 64)
            .tcp(self.src_port, self.dst_port, self.seq, 65535)
            .ack(1)
            .psh();
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        self.seq += payload.len() as u32;
        engine.handle("eth0", "lab", Direction::NotKnown, 0, &packet)
    }

    /// Send bytes that start `offset` past the current sequence number,
    /// leaving it untouched.
    fn send_at(&self, engine: &Engine, offset: usize, payload: &[u8]) -> Result<()> {
        let seq = self.seq + offset as u32;
        let builder = PacketBuilder::ipv4(self.src, self.dst, 64)
            .tcp(self.src_port, self.dst_port, seq, 65535)
            .ack(1)
            .psh();
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        engine.handle("eth0", "lab", Direction::NotKnown, 0, &packet)
    }

    fn fin(&mut self, engine: &Engine) {
        let builder = PacketBuilder::ipv4(self.src, self.dst, 64)
            .tcp(self.src_port, self.dst_port, self.seq, 65535)
            .ack(1)
            .fin();
        let mut packet = Vec::with_capacity(builder.size(0));
        builder.write(&mut packet, &[]).unwrap();
        engine.handle("eth0", "lab", Direction::NotKnown, 0, &packet).unwrap();
    }
}

fn udp(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4(src, dst, 64).udp(src_port, dst_port);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, payload).unwrap();
    packet
}

// Test 1: An HTTP exchange identified by content, with the response
// correlated to its request through the reverse flow
#[test]
fn test_http_exchange() {
    let (sink, engine) = setup();
    let mut client = Peer::client(8080);
    let mut server = Peer::server(8080);

    client.syn(&engine);
    server.syn(&engine);
    client
        .send(&engine, b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .unwrap();
    server
        .send(&engine, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    client.fin(&engine);

    let events = sink.take();
    let names: Vec<_> = events.iter().map(|e| e.payload.name()).collect();
    assert_eq!(
        names,
        vec![
            "connection_up",
            "http_request",
            "connection_up",
            "http_response",
            "connection_down"
        ]
    );

    let request = &events[1];
    assert_eq!(request.context.kind(), ContextKind::HttpRequest);
    assert_eq!(
        request.context.describe(),
        "ipv4:10.1.0.5/tcp:51000/http"
    );

    match &events[3].payload {
        EventPayload::HttpResponse { code, url, body, .. } => {
            assert_eq!(*code, 200);
            assert_eq!(url.as_deref(), Some("http://example.com/index.html"));
            assert_eq!(body, b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }
    let response_ctx = &events[3].context;
    assert_eq!(response_ctx.reverse().map(|r| r.id()), Some(request.context.id()));
}

// Test 1b: A request split into segments that arrive out of order is
// reassembled and decoded exactly once
#[test]
fn test_http_out_of_order_segments() {
    let (sink, engine) = setup();
    let mut client = Peer::client(8080);
    let request = b"GET /a/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";

    client.syn(&engine);
    client.send_at(&engine, 30, &request[30..]).unwrap();
    client.send_at(&engine, 0, &request[..20]).unwrap();
    client.send_at(&engine, 20, &request[20..30]).unwrap();

    let events = sink.take();
    let names: Vec<_> = events.iter().map(|e| e.payload.name()).collect();
    assert_eq!(names, vec!["connection_up", "http_request"]);
    match &events[1].payload {
        EventPayload::HttpRequest { method, url, .. } => {
            assert_eq!(method, "GET");
            assert_eq!(url, "http://example.com/a/index.html");
        }
        other => panic!("unexpected {other:?}"),
    }

    // A retransmission of the whole request adds nothing.
    client.send_at(&engine, 0, request).unwrap();
    assert!(sink.take().is_empty());
}

// Test 2: DNS query and answer over UDP are decoded on both flows
#[test]
fn test_dns_transaction() {
    let (sink, engine) = setup();
    let resolver = [10, 1, 0, 53];
    let query = [
        0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, //
        3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'o', b'r', b'g', 0, //
        0, 1, 0, 1,
    ];
    let mut answer = query.to_vec();
    answer[2] = 0x81;
    answer[3] = 0x80;
    answer[7] = 1;
    answer.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 93, 184, 216, 34]);

    engine
        .handle("eth0", "lab", Direction::NotKnown, 10, &udp(CLIENT, resolver, 40001, 53, &query))
        .unwrap();
    engine
        .handle("eth0", "lab", Direction::NotKnown, 20, &udp(resolver, CLIENT, 53, 40001, &answer))
        .unwrap();

    let events = sink.take();
    assert_eq!(events.len(), 2);
    let (EventPayload::DnsMessage(q), EventPayload::DnsMessage(a)) = (&events[0].payload, &events[1].payload) else {
        panic!("expected dns messages");
    };
    assert!(!q.header.qr);
    assert_eq!(q.queries[0].name, "www.example.org");
    assert!(a.header.qr);
    assert_eq!(a.answers.len(), 1);
    assert_eq!(events[1].timestamp_us, 20);
    assert_eq!(events[0].context.kind(), ContextKind::Dns);
}

// Test 3: TLS on 443 reports the ClientHello server name
#[test]
fn test_tls_client_hello() {
    let (sink, engine) = setup();
    let mut client = Peer::client(443);

    let host = b"secure.example";
    let mut sni = ((host.len() + 3) as u16).to_be_bytes().to_vec();
    sni.push(0);
    sni.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni.extend_from_slice(host);

    let mut hello = vec![3, 3];
    hello.extend_from_slice(&[7u8; 32]);
    hello.push(0);
    hello.extend_from_slice(&[0, 2, 0x13, 0x02, 1, 0]);
    let ext_len = (4 + sni.len()) as u16;
    hello.extend_from_slice(&ext_len.to_be_bytes());
    hello.extend_from_slice(&[0, 0]);
    hello.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    hello.extend_from_slice(&sni);

    let mut handshake = vec![1];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);
    let mut record = vec![22, 3, 1];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);

    client.syn(&engine);
    client.send(&engine, &record[..10]).unwrap();
    client.send(&engine, &record[10..]).unwrap();

    let hello = sink
        .payloads()
        .into_iter()
        .find(|p| p.name() == "tls_client_hello")
        .unwrap();
    assert!(matches!(
        hello,
        EventPayload::TlsClientHello { server_name: Some(ref name), .. } if name == "secure.example"
    ));
}

// Test 4: A decoder that rejects its input hands the stream to the
// unrecognised decoder for good
#[test]
fn test_parse_failure_falls_back() {
    let (sink, engine) = setup();
    let mut client = Peer::client(25);
    client.syn(&engine);
    let err = client.send(&engine, b"HELO a\rbroken\r\n").unwrap_err();
    assert!(err.is_parse_error());
    client.send(&engine, b"MAIL FROM:<x@y>\r\n").unwrap();

    let payloads = sink.payloads();
    assert_eq!(
        payloads.last(),
        Some(&EventPayload::UnrecognisedStream {
            data: b"MAIL FROM:<x@y>\r\n".to_vec(),
            position: 0
        })
    );

    let root = engine.get_root_context("eth0", "lab");
    let tcp = root.children()[0].children()[0].clone();
    let guard = tcp.state();
    let ContextState::Tcp(state) = &*guard else {
        panic!("expected tcp state");
    };
    assert_eq!(state.handler(), Some(handlers::UNRECOGNISED_STREAM));
}

// Test 5: Contexts left idle are reaped; closing the root releases the rest
#[test]
fn test_reaping_and_close() {
    let sink = Arc::new(VecSink::new());
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(EngineConfig::default(), sink.clone(), clock.clone());

    engine
        .handle("eth0", "lab", Direction::NotKnown, 0, &udp(CLIENT, SERVER, 7000, 7001, b"payload"))
        .unwrap();
    // root, ip, udp, unrecognised datagram
    assert_eq!(engine.context_count(), 4);
    drop(sink.take());

    clock.advance(engine.config().default_ttl + 1);
    engine.sweep();
    assert_eq!(engine.context_count(), 1);

    assert!(engine.close_root_context("eth0", "lab"));
    assert_eq!(engine.root_count(), 0);
    assert_eq!(engine.context_count(), 0);
}

// Test 6: Events flow through the bounded queue in order
#[test]
fn test_queue_sink_ordering() {
    let (sink, rx) = QueueSink::new(16);
    let engine = Engine::new(EngineConfig::default(), Arc::new(sink));
    for i in 0..3u8 {
        engine
            .handle("eth0", "lab", Direction::ToTarget, i64::from(i), &udp(CLIENT, SERVER, 7000, 7001, &[i]))
            .unwrap();
    }
    let received: Vec<_> = rx.try_iter().map(|e| (e.timestamp_us, e.payload)).collect();
    assert_eq!(
        received,
        (0..3u8)
            .map(|i| (i64::from(i), EventPayload::UnrecognisedDatagram { data: vec![i] }))
            .collect::<Vec<_>>()
    );
}
