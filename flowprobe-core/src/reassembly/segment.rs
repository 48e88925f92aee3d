//! TCP segment reassembly for one direction of a connection.
//!
//! Tracks the connection flags and the next expected sequence number, queues
//! out-of-order segments, and hands back the bytes that became contiguous.
//! Delivery is in order with no duplicates and no gaps, except when the
//! queue overflows and the reassembler jumps over a missing range.

use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::debug;

/// Largest distance ahead of the expected sequence a segment may start at.
/// Matches the biggest window TCP window scaling can advertise.
const MAX_WINDOW: u32 = 1 << 30;

/// The TCP flags that drive connection tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    /// Decode from the flags byte of a TCP header.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
            ack: bits & 0x10 != 0,
        }
    }
}

/// A queued out-of-order segment covering `[first, last)`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub first: u32,
    pub last: u32,
    pub data: Vec<u8>,
}

/// What one arriving segment produced.
#[derive(Debug, Default)]
pub struct SegmentOutcome<'a> {
    /// First ACK seen on this flow.
    pub connection_up: bool,
    /// First FIN or RST seen on this flow.
    pub connection_down: bool,
    /// Newly contiguous bytes, in stream order.
    pub chunks: Vec<Cow<'a, [u8]>>,
}

/// Per-direction TCP stream state.
#[derive(Debug)]
pub struct SegmentReassembler {
    max_segments: usize,
    seq_expected: u32,
    /// Sequence-space anchor; queue keys are signed offsets from here.
    /// Kept within `MAX_WINDOW` of `seq_expected` so keys never wrap.
    base: u32,
    ack_received: Option<u32>,
    syn_observed: bool,
    connected: bool,
    fin_observed: bool,
    segments: BTreeMap<i32, Segment>,
}

impl SegmentReassembler {
    pub fn new(max_segments: usize) -> Self {
        Self {
            max_segments: max_segments.max(1),
            seq_expected: 0,
            base: 0,
            ack_received: None,
            syn_observed: false,
            connected: false,
            fin_observed: false,
            segments: BTreeMap::new(),
        }
    }

    pub fn seq_expected(&self) -> u32 {
        self.seq_expected
    }

    pub fn ack_received(&self) -> Option<u32> {
        self.ack_received
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn fin_observed(&self) -> bool {
        self.fin_observed
    }

    /// Number of queued out-of-order segments.
    pub fn queued(&self) -> usize {
        self.segments.len()
    }

    /// Process one arriving segment.
    pub fn process<'a>(
        &mut self,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &'a [u8],
    ) -> SegmentOutcome<'a> {
        let mut out = SegmentOutcome::default();

        if flags.ack {
            self.ack_received = Some(ack);
        }

        if flags.syn {
            self.syn_observed = true;
            self.seq_expected = seq.wrapping_add(1);
            self.base = self.seq_expected;
            self.segments.clear();
            return out;
        }

        if flags.ack && !self.connected {
            self.connected = true;
            out.connection_up = true;
        }

        if (flags.fin || flags.rst) && !self.fin_observed {
            self.fin_observed = true;
            out.connection_down = true;
            return out;
        }

        // Mid-stream join: nothing to reassemble against.
        if !self.syn_observed || payload.is_empty() {
            return out;
        }

        if seq == self.seq_expected {
            self.seq_expected = seq_add(seq, payload.len());
            out.chunks.push(Cow::Borrowed(payload));
        } else {
            self.enqueue(seq, payload);
        }

        self.drain(&mut out.chunks);
        out
    }

    fn enqueue(&mut self, seq: u32, payload: &[u8]) {
        let last = seq_add(seq, payload.len());
        if seq_le(last, self.seq_expected) {
            // Entirely before what we want: a retransmission.
            return;
        }
        let behind = self.seq_expected.wrapping_sub(seq);
        if behind < MAX_WINDOW {
            // Straddles the expected sequence; only the tail is new.
            self.insert(self.seq_expected, last, &payload[behind as usize..]);
        } else if seq.wrapping_sub(self.seq_expected) < MAX_WINDOW {
            self.insert(seq, last, payload);
        } else {
            debug!(seq, expected = self.seq_expected, "segment outside window, dropped");
        }
    }

    fn insert(&mut self, first: u32, last: u32, data: &[u8]) {
        self.rebase();
        let key = self.key(first);
        let keep_existing = self
            .segments
            .get(&key)
            .is_some_and(|existing| existing.data.len() >= data.len());
        if !keep_existing {
            self.segments.insert(
                key,
                Segment {
                    first,
                    last,
                    data: data.to_vec(),
                },
            );
        }

        if self.segments.len() > self.max_segments {
            if let Some(earliest) = self.segments.values().next() {
                debug!(
                    from = self.seq_expected,
                    to = earliest.first,
                    "segment queue full, skipping gap"
                );
                self.seq_expected = earliest.first;
            }
        }
    }

    fn key(&self, seq: u32) -> i32 {
        seq.wrapping_sub(self.base) as i32
    }

    /// Move the key anchor up to `seq_expected` once it has drifted far
    /// enough that queued offsets could leave the `i32` range.
    fn rebase(&mut self) {
        if self.seq_expected.wrapping_sub(self.base) < MAX_WINDOW {
            return;
        }
        self.base = self.seq_expected;
        let queued = std::mem::take(&mut self.segments);
        self.segments = queued
            .into_values()
            .map(|segment| (self.key(segment.first), segment))
            .collect();
    }

    fn drain<'a>(&mut self, chunks: &mut Vec<Cow<'a, [u8]>>) {
        while let Some(entry) = self.segments.first_entry() {
            let segment = entry.get();
            if !seq_le(segment.first, self.seq_expected) {
                break;
            }
            let segment = entry.remove();
            if seq_le(segment.last, self.seq_expected) {
                continue;
            }
            let unwanted = self.seq_expected.wrapping_sub(segment.first) as usize;
            self.seq_expected = segment.last;
            let mut data = segment.data;
            data.drain(..unwanted);
            chunks.push(Cow::Owned(data));
        }
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}
