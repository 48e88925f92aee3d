//! Fuzz target for the engine entry point.
//!
//! Every captured frame ends up in `Engine::handle`, so this exercises:
//! - Link-layer stripping for Ethernet, Linux SLL and raw IP
//! - IPv4 / IPv6 header validation
//! - Next-protocol dispatch (TCP, UDP, ICMP, GRE, ESP)
//! - Port and content based decoder selection

#![no_main]

use std::sync::Arc;

use flowprobe::capture::link;
use flowprobe_core::{Direction, Engine, EngineConfig, VecSink};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let sink = Arc::new(VecSink::new());
    let engine = Engine::new(EngineConfig::default(), sink);

    // As a bare IP packet
    let _ = engine.handle("fuzz", "fuzz", Direction::NotKnown, 0, data);

    // Behind each supported link layer
    for link_type in [link::LINKTYPE_ETHERNET, link::LINKTYPE_LINUX_SLL, link::LINKTYPE_RAW] {
        if let Ok(Some(ip)) = link::ip_payload(link_type, data) {
            let direction = link::infer_direction(ip, None);
            let _ = engine.handle("fuzz", "fuzz", direction, 1, ip);
        }
    }
});
