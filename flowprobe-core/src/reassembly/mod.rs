//! Reassembly of fragmented IP datagrams and out-of-order TCP segments.

mod fragment;
mod segment;

pub use fragment::{ipv4_checksum, Fragment, FragmentHole, FragmentReassembler};
pub use segment::{Segment, SegmentOutcome, SegmentReassembler, TcpFlags};
