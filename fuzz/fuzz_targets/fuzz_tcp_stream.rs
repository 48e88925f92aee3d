//! Fuzz target for TCP reassembly and the stream decoders.
//!
//! The first byte picks a server port (and so a decoder), the second how
//! the rest is cut into segments. Segments alternate between client and
//! server, and every third one is delivered out of order, covering:
//! - Segment queueing, duplicates and sequence jumps
//! - HTTP, SMTP, FTP, SIP and TLS parsing across segment boundaries
//! - Content sniffing on an unbound port
//! - Fallback to the unrecognised decoder after a parse error

#![no_main]

use std::sync::Arc;

use etherparse::PacketBuilder;
use flowprobe_core::{Direction, Engine, EngineConfig, VecSink};
use libfuzzer_sys::fuzz_target;

const PORTS: [u16; 8] = [21, 25, 80, 110, 443, 5060, 8080, 9999];

fn segment(from_client: bool, port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let (src, dst, src_port, dst_port) = if from_client {
        ([10, 0, 0, 1], [10, 0, 0, 2], 40000, port)
    } else {
        ([10, 0, 0, 2], [10, 0, 0, 1], port, 40000)
    };
    let mut builder = PacketBuilder::ipv4(src, dst, 64)
        .tcp(src_port, dst_port, seq, 65535)
        .ack(1);
    if flags & 1 != 0 {
        builder = builder.psh();
    }
    if flags & 2 != 0 {
        builder = builder.fin();
    }
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    if builder.write(&mut packet, payload).is_err() {
        return Vec::new();
    }
    packet
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let port = PORTS[usize::from(data[0]) % PORTS.len()];
    let chunk = usize::from(data[1] % 64) + 1;
    let payload = &data[2..];

    let sink = Arc::new(VecSink::new());
    let engine = Engine::new(EngineConfig::default(), sink);

    let mut seq = [1000u32, 5000u32];
    let mut held: Option<Vec<u8>> = None;
    for (i, piece) in payload.chunks(chunk).enumerate() {
        let from_client = (i / 2) % 2 == 0;
        let side = usize::from(!from_client);
        let packet = segment(from_client, port, seq[side], piece[0], piece);
        seq[side] = seq[side].wrapping_add(piece.len() as u32);

        if i % 3 == 1 && held.is_none() {
            held = Some(packet);
            continue;
        }
        let _ = engine.handle("fuzz", "fuzz", Direction::NotKnown, i as i64, &packet);
        if let Some(late) = held.take() {
            let _ = engine.handle("fuzz", "fuzz", Direction::NotKnown, i as i64, &late);
        }
    }
    if let Some(late) = held {
        let _ = engine.handle("fuzz", "fuzz", Direction::NotKnown, 0, &late);
    }
});
