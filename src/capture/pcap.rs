//! PCAP and PCAPNG file reader.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use super::RawPacket;
use crate::error::{CaptureError, Error, Result};

/// Buffer size for reading capture files (64KB).
const BUFFER_SIZE: usize = 65536;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

type Source = BufReader<Box<dyn Read + Send>>;

/// Reader for PCAP and PCAPNG files, with optional gzip decompression.
pub struct PcapReader {
    inner: ReaderInner,
    frame_number: u64,
    link_type: u16,
    /// PCAP timestamps are in nanoseconds rather than microseconds.
    nanosecond: bool,
}

enum ReaderInner {
    Legacy(LegacyPcapReader<Source>),
    Ng(PcapNGReader<Source>),
}

fn open_source(path: &Path, gzipped: bool) -> Result<Source> {
    let file = File::open(path).map_err(|_| CaptureError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let reader: Box<dyn Read + Send> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(BufReader::with_capacity(BUFFER_SIZE, reader))
}

fn invalid(reason: impl Into<String>) -> Error {
    CaptureError::InvalidFormat {
        reason: reason.into(),
    }
    .into()
}

impl PcapReader {
    /// Open a capture file. Gzipped files are detected by extension or
    /// magic bytes and decompressed on the fly.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let gzipped = is_gzip_file(path)?;

        // Peek at the format magic, then reopen from the start.
        let mut magic = [0u8; 4];
        open_source(path, gzipped)?
            .read_exact(&mut magic)
            .map_err(|_| invalid("File too short to read magic number"))?;
        let source = open_source(path, gzipped)?;

        match magic {
            [0xd4, 0xc3, 0xb2, 0xa1] | [0xa1, 0xb2, 0xc3, 0xd4] => Self::open_legacy(source, false),
            [0x4d, 0x3c, 0xb2, 0xa1] | [0xa1, 0xb2, 0x3c, 0x4d] => Self::open_legacy(source, true),
            [0x0a, 0x0d, 0x0d, 0x0a] => Self::open_ng(source),
            _ => Err(invalid(format!("Unknown magic number: {magic:02x?}"))),
        }
    }

    fn open_legacy(source: Source, nanosecond: bool) -> Result<Self> {
        let reader = LegacyPcapReader::new(BUFFER_SIZE, source)
            .map_err(|e| invalid(format!("Failed to parse PCAP header: {e}")))?;
        Ok(Self {
            inner: ReaderInner::Legacy(reader),
            frame_number: 0,
            link_type: 1,
            nanosecond,
        })
    }

    fn open_ng(source: Source) -> Result<Self> {
        let reader = PcapNGReader::new(BUFFER_SIZE, source)
            .map_err(|e| invalid(format!("Failed to parse PCAPNG header: {e}")))?;
        Ok(Self {
            inner: ReaderInner::Ng(reader),
            frame_number: 0,
            // Updated from the interface description block.
            link_type: 1,
            nanosecond: false,
        })
    }

    /// Link type of the packets most recently read.
    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    /// Frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Read the next packet.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        match &mut self.inner {
            ReaderInner::Legacy(reader) => {
                next_legacy(reader, &mut self.frame_number, &mut self.link_type, self.nanosecond)
            }
            ReaderInner::Ng(reader) => next_ng(reader, &mut self.frame_number, &mut self.link_type),
        }
    }
}

fn next_legacy(
    reader: &mut LegacyPcapReader<Source>,
    frame_number: &mut u64,
    link_type: &mut u16,
    nanosecond: bool,
) -> Result<Option<RawPacket>> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    PcapBlockOwned::Legacy(packet) => {
                        *frame_number += 1;
                        let fraction = if nanosecond {
                            i64::from(packet.ts_usec) / 1000
                        } else {
                            i64::from(packet.ts_usec)
                        };
                        Some(RawPacket::new(
                            *frame_number,
                            i64::from(packet.ts_sec) * 1_000_000 + fraction,
                            packet.caplen,
                            packet.origlen,
                            *link_type,
                            packet.data.to_vec(),
                        ))
                    }
                    PcapBlockOwned::LegacyHeader(header) => {
                        *link_type = header.network.0 as u16;
                        None
                    }
                    _ => None,
                };
                reader.consume(offset);
                if packet.is_some() {
                    return Ok(packet);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("Refill error: {e}")))?;
            }
            Err(e) => return Err(invalid(format!("Parse error: {e}"))),
        }
    }
}

fn next_ng(
    reader: &mut PcapNGReader<Source>,
    frame_number: &mut u64,
    link_type: &mut u16,
) -> Result<Option<RawPacket>> {
    use pcap_parser::pcapng::Block;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        *link_type = idb.linktype.0 as u16;
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        *frame_number += 1;
                        // Interface time units, microseconds by default.
                        let timestamp_us = (i64::from(epb.ts_high) << 32) | i64::from(epb.ts_low);
                        Some(RawPacket::new(
                            *frame_number,
                            timestamp_us,
                            epb.caplen,
                            epb.origlen,
                            *link_type,
                            epb.data.to_vec(),
                        ))
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        *frame_number += 1;
                        Some(RawPacket::new(
                            *frame_number,
                            0,
                            spb.data.len() as u32,
                            spb.origlen,
                            *link_type,
                            spb.data.to_vec(),
                        ))
                    }
                    _ => None,
                };
                reader.consume(offset);
                if packet.is_some() {
                    return Ok(packet);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("Refill error: {e}")))?;
            }
            Err(e) => return Err(invalid(format!("Parse error: {e}"))),
        }
    }
}

/// Check if a file is gzipped by extension or magic bytes.
fn is_gzip_file(path: &Path) -> Result<bool> {
    if is_gzip_extension(path) {
        return Ok(true);
    }

    let mut file = File::open(path).map_err(|_| CaptureError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(_) => Ok(false),
    }
}

/// Whether a path has a `.gz` extension.
pub fn is_gzip_extension<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|name| name.to_lowercase().ends_with(".gz"))
}

impl Iterator for PcapReader {
    type Item = Result<RawPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
