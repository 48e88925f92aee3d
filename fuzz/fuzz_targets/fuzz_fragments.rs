//! Fuzz target for IPv4 fragment reassembly.
//!
//! The input is cut into fragments with fuzzer-chosen offsets and
//! "more fragments" flags, covering:
//! - Overlapping and duplicate fragments
//! - Holes that are never filled
//! - Fragment queue overflow and eviction
//! - Re-entry into IP processing on completion

#![no_main]

use std::sync::Arc;

use etherparse::{IpFragOffset, IpNumber, Ipv4Header};
use flowprobe_core::{Direction, Engine, EngineConfig, VecSink};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let sink = Arc::new(VecSink::new());
    let engine = Engine::new(EngineConfig::default().with_max_fragments(8), sink);

    // Each fragment: offset (1 byte, in 8-byte units), flags (1 byte),
    // length (1 byte), then that many payload bytes.
    let mut rest = data;
    while rest.len() >= 3 {
        let offset = u16::from(rest[0]);
        let more = rest[1] & 1 != 0;
        let id = u16::from(rest[1] >> 4);
        let len = usize::from(rest[2]).min(rest.len() - 3);
        let payload = &rest[3..3 + len];
        rest = &rest[3 + len..];

        let Ok(mut header) = Ipv4Header::new(
            payload.len() as u16,
            64,
            IpNumber::UDP,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
        ) else {
            continue;
        };
        header.identification = id;
        header.more_fragments = more;
        let Ok(fragment_offset) = IpFragOffset::try_new(offset) else {
            continue;
        };
        header.fragment_offset = fragment_offset;
        header.header_checksum = header.calc_header_checksum();

        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(payload);
        let _ = engine.handle("fuzz", "fuzz", Direction::NotKnown, 0, &packet);
    }
});
