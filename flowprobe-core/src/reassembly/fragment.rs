//! IPv4 fragment reassembly using the RFC 815 hole-list algorithm.
//!
//! One [`FragmentReassembler`] lives in each IPv4 context. It tracks every
//! fragmentation id seen on that flow: a hole list describing the bytes still
//! missing, the header of the offset-zero fragment, and a bounded queue of
//! fragment payloads shared across ids.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::error::ProtocolError;

/// Upper bound of a hole that extends to the (unknown) end of the datagram.
const OPEN_END: usize = usize::MAX;

/// Largest IPv4 datagram.
const MAX_DATAGRAM: usize = 65535;

/// One fragment awaiting reassembly. Offsets are inclusive payload offsets.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: u16,
    pub first: usize,
    pub last: usize,
    pub data: Vec<u8>,
}

/// A gap in a datagram being reassembled. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHole {
    pub first: usize,
    pub last: usize,
}

/// Per-IP-context fragment tracker.
#[derive(Debug)]
pub struct FragmentReassembler {
    max_fragments: usize,
    fragments: VecDeque<Fragment>,
    holes: HashMap<u16, Vec<FragmentHole>>,
    headers: HashMap<u16, Vec<u8>>,
}

impl FragmentReassembler {
    pub fn new(max_fragments: usize) -> Self {
        Self {
            max_fragments: max_fragments.max(1),
            fragments: VecDeque::new(),
            holes: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    /// True if fragments for `id` are outstanding.
    pub fn is_tracking(&self, id: u16) -> bool {
        self.holes.contains_key(&id)
    }

    /// Number of queued fragments, across all ids.
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    /// Outstanding holes for `id`.
    pub fn holes(&self, id: u16) -> Option<&[FragmentHole]> {
        self.holes.get(&id).map(Vec::as_slice)
    }

    /// Add one fragment.
    ///
    /// `header` is the fragment's IPv4 header (options included) and
    /// `payload` the bytes it carries at byte `offset`. Returns the complete
    /// datagram when this fragment fills the last hole, with total length,
    /// the more-fragments flag and the header checksum fixed up.
    pub fn add(
        &mut self,
        id: u16,
        offset: usize,
        more_fragments: bool,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::InvalidField {
                protocol: "IPv4",
                field: "fragment",
                reason: "fragment carries no payload".to_string(),
            });
        }

        while self.fragments.len() >= self.max_fragments {
            self.evict_oldest();
        }

        let frag_first = offset;
        let frag_last = offset + payload.len() - 1;

        let holes = self.holes.entry(id).or_insert_with(|| {
            vec![FragmentHole {
                first: 0,
                last: OPEN_END,
            }]
        });
        fill_holes(holes, frag_first, frag_last, more_fragments);
        let complete = holes.is_empty();

        if frag_first == 0 {
            self.headers.insert(id, header.to_vec());
        }

        if complete {
            return self.assemble(id, frag_first, frag_last, payload).map(Some);
        }

        self.fragments.push_back(Fragment {
            id,
            first: frag_first,
            last: frag_last,
            data: payload.to_vec(),
        });
        Ok(None)
    }

    /// Drop the oldest fragment together with everything else known about
    /// its id; that datagram can no longer complete.
    fn evict_oldest(&mut self) {
        let Some(oldest) = self.fragments.pop_front() else {
            return;
        };
        debug!(ip_id = oldest.id, "fragment queue full, evicting datagram");
        self.discard(oldest.id);
    }

    fn discard(&mut self, id: u16) {
        self.holes.remove(&id);
        self.headers.remove(&id);
        self.fragments.retain(|f| f.id != id);
    }

    fn assemble(
        &mut self,
        id: u16,
        frag_first: usize,
        frag_last: usize,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let Some(header) = self.headers.get(&id).cloned() else {
            self.discard(id);
            return Err(ProtocolError::InvalidField {
                protocol: "IPv4",
                field: "fragment",
                reason: "no offset-zero fragment".to_string(),
            });
        };

        let payload_len = self
            .fragments
            .iter()
            .filter(|f| f.id == id)
            .map(|f| f.last + 1)
            .chain(std::iter::once(frag_last + 1))
            .max()
            .unwrap_or(0);
        let total = header.len() + payload_len;
        if total > MAX_DATAGRAM {
            self.discard(id);
            return Err(ProtocolError::InvalidField {
                protocol: "IPv4",
                field: "total_length",
                reason: format!("reassembled datagram of {total} bytes"),
            });
        }

        let mut pdu = vec![0u8; total];
        let hlen = header.len();
        for f in self.fragments.iter().filter(|f| f.id == id) {
            pdu[hlen + f.first..hlen + f.last + 1].copy_from_slice(&f.data);
        }
        pdu[hlen + frag_first..hlen + frag_last + 1].copy_from_slice(payload);
        pdu[..hlen].copy_from_slice(&header);

        // Clear more-fragments, set total length, recompute checksum.
        pdu[6] &= 0xdf;
        pdu[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pdu[10] = 0;
        pdu[11] = 0;
        let cksum = ipv4_checksum(&pdu[..hlen]);
        pdu[10..12].copy_from_slice(&cksum.to_be_bytes());

        self.discard(id);
        Ok(pdu)
    }
}

/// Apply one fragment `[frag_first, frag_last]` to a hole list.
fn fill_holes(holes: &mut Vec<FragmentHole>, frag_first: usize, frag_last: usize, more: bool) {
    let mut i = 0;
    while i < holes.len() {
        let hole = holes[i];
        if frag_first > hole.last || frag_last < hole.first {
            i += 1;
            continue;
        }
        holes.swap_remove(i);
        if frag_first > hole.first {
            holes.push(FragmentHole {
                first: hole.first,
                last: frag_first - 1,
            });
        }
        if more && frag_last < hole.last {
            holes.push(FragmentHole {
                first: frag_last + 1,
                last: hole.last,
            });
        }
    }
}

/// RFC 1071 ones-complement checksum.
pub fn ipv4_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
