//! The protocol dispatch pipeline.
//!
//! Each stage takes the engine, the parent context and a [`Pdu`], resolves
//! or creates its own context under the parent, and hands what remains to
//! the next stage. Stages release their context's lock before calling the
//! next one.
//!
//! | Stage | Module | Context address |
//! |-------|--------|-----------------|
//! | IPv4 / IPv6 | [`ip`] | source and destination IP |
//! | TCP | [`tcp`] | source and destination port |
//! | UDP | [`udp`] | source and destination port |
//! | ICMP | [`icmp`] | `(Control, Icmp)` sentinel |
//! | GRE | [`gre`] | `(Transport, Gre)` sentinel |
//! | ESP | [`esp`] | `(Transport, Esp)` sentinel |

pub mod esp;
pub mod gre;
pub mod icmp;
pub mod ip;
pub mod ports;
pub mod tcp;
pub mod udp;

pub use ports::{DecodeFn, Handler, PortTable};

use crate::address::Direction;

/// A slice of packet bytes travelling down the pipeline, with the capture
/// time and direction of the packet it came from.
#[derive(Debug, Clone, Copy)]
pub struct Pdu<'a> {
    pub data: &'a [u8],
    pub timestamp_us: i64,
    pub direction: Direction,
    /// Tunnel layers already unwrapped to reach these bytes.
    pub depth: usize,
}

impl<'a> Pdu<'a> {
    pub fn new(data: &'a [u8], timestamp_us: i64, direction: Direction) -> Self {
        Self {
            data,
            timestamp_us,
            direction,
            depth: 0,
        }
    }

    /// Same time and direction, different bytes.
    pub fn with_data<'b>(&self, data: &'b [u8]) -> Pdu<'b> {
        Pdu {
            data,
            timestamp_us: self.timestamp_us,
            direction: self.direction,
            depth: self.depth,
        }
    }

    /// The same bytes seen one tunnel layer deeper.
    pub fn decapsulated(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }

    /// The bytes from `offset` on (empty if past the end).
    pub fn skip(&self, offset: usize) -> Pdu<'a> {
        self.with_data(self.data.get(offset..).unwrap_or(&[]))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
