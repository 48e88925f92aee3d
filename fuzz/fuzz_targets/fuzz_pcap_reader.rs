//! Fuzz target for the capture file reader: format magic, gzip sniffing,
//! legacy and NG block parsing over arbitrary bytes.

#![no_main]

use std::io::Write;

use flowprobe::capture::PcapReader;
use libfuzzer_sys::fuzz_target;
use tempfile::NamedTempFile;

fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = NamedTempFile::new() else {
        return;
    };
    if file.write_all(data).and_then(|()| file.flush()).is_err() {
        return;
    }
    if let Ok(reader) = PcapReader::open(file.path()) {
        for packet in reader {
            if packet.is_err() {
                break;
            }
        }
    }
});
