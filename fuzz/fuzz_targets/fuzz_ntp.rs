//! Fuzz target for the NTP mode dispatch (timestamp, control, private).

#![no_main]

use flowprobe_core::decoders::ntp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = ntp::parse(data);
});
