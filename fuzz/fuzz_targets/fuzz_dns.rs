//! Fuzz target for the DNS message parser.
//!
//! Covers header and section counts, name compression pointers (including
//! loops) and resource record data. Messages that parse are re-encoded and
//! parsed again.

#![no_main]

use flowprobe_core::decoders::dns::DnsMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = DnsMessage::parse(data) {
        let _ = DnsMessage::parse(&message.encode());
    }
});
