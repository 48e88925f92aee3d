//! Packet builders for tests.
//!
//! Checksums are left zero; the pipeline does not verify them.

/// Builder for IPv4 datagrams, including fragments.
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    identification: u16,
    /// Fragment offset in bytes; must be a multiple of 8.
    fragment_offset: usize,
    more_fragments: bool,
    ttl: u8,
    protocol: u8,
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    payload: Vec<u8>,
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self {
            identification: 0x0001,
            fragment_offset: 0,
            more_fragments: false,
            ttl: 64,
            protocol: 6, // TCP
            src_ip: [192, 168, 1, 1],
            dst_ip: [192, 168, 1, 2],
            payload: Vec::new(),
        }
    }
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn tcp(self) -> Self {
        self.protocol(6)
    }

    pub fn udp(self) -> Self {
        self.protocol(17)
    }

    pub fn icmp(self) -> Self {
        self.protocol(1)
    }

    pub fn src_ip(mut self, ip: [u8; 4]) -> Self {
        self.src_ip = ip;
        self
    }

    pub fn dst_ip(mut self, ip: [u8; 4]) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    /// Mark the datagram as a fragment starting `offset` bytes into the
    /// original payload.
    pub fn fragment(mut self, offset: usize, more: bool) -> Self {
        self.fragment_offset = offset;
        self.more_fragments = more;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = 20 + self.payload.len() as u16;
        let mut flags_fragment = (self.fragment_offset / 8) as u16 & 0x1fff;
        if self.more_fragments {
            flags_fragment |= 0x2000;
        }

        let mut packet = Vec::with_capacity(total_length as usize);
        packet.push(0x45); // Version 4, IHL 5
        packet.push(0x00);
        packet.extend_from_slice(&total_length.to_be_bytes());
        packet.extend_from_slice(&self.identification.to_be_bytes());
        packet.extend_from_slice(&flags_fragment.to_be_bytes());
        packet.push(self.ttl);
        packet.push(self.protocol);
        packet.extend_from_slice(&[0x00, 0x00]); // Checksum
        packet.extend_from_slice(&self.src_ip);
        packet.extend_from_slice(&self.dst_ip);
        packet.extend_from_slice(&self.payload);
        packet
    }
}

/// Builder for IPv6 packets (fixed header only).
#[derive(Debug, Clone)]
pub struct Ipv6Builder {
    next_header: u8,
    src: [u8; 16],
    dst: [u8; 16],
    payload: Vec<u8>,
}

impl Default for Ipv6Builder {
    fn default() -> Self {
        let mut src = [0u8; 16];
        src[..2].copy_from_slice(&[0x20, 0x01]);
        src[15] = 1;
        let mut dst = src;
        dst[15] = 2;
        Self {
            next_header: 59, // No next header
            src,
            dst,
            payload: Vec::new(),
        }
    }
}

impl Ipv6Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_header(mut self, next_header: u8) -> Self {
        self.next_header = next_header;
        self
    }

    pub fn src(mut self, src: [u8; 16]) -> Self {
        self.src = src;
        self
    }

    pub fn dst(mut self, dst: [u8; 16]) -> Self {
        self.dst = dst;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(40 + self.payload.len());
        packet.extend_from_slice(&[0x60, 0x00, 0x00, 0x00]);
        packet.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        packet.push(self.next_header);
        packet.push(64); // Hop limit
        packet.extend_from_slice(&self.src);
        packet.extend_from_slice(&self.dst);
        packet.extend_from_slice(&self.payload);
        packet
    }
}

/// Builder for TCP segments.
#[derive(Debug, Clone)]
pub struct TcpBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: Vec<u8>,
}

impl Default for TcpBuilder {
    fn default() -> Self {
        Self {
            src_port: 12345,
            dst_port: 80,
            seq: 1,
            ack: 0,
            flags: 0x02, // SYN
            window: 65535,
            payload: Vec::new(),
        }
    }
}

impl TcpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack_num(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn syn(self) -> Self {
        self.flags(0x02)
    }

    pub fn syn_ack(self) -> Self {
        self.flags(0x12)
    }

    pub fn ack(self) -> Self {
        self.flags(0x10)
    }

    pub fn psh_ack(self) -> Self {
        self.flags(0x18)
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut segment = Vec::with_capacity(20 + self.payload.len());
        segment.extend_from_slice(&self.src_port.to_be_bytes());
        segment.extend_from_slice(&self.dst_port.to_be_bytes());
        segment.extend_from_slice(&self.seq.to_be_bytes());
        segment.extend_from_slice(&self.ack.to_be_bytes());
        segment.push(5 << 4); // Data offset
        segment.push(self.flags);
        segment.extend_from_slice(&self.window.to_be_bytes());
        segment.extend_from_slice(&[0x00, 0x00]); // Checksum
        segment.extend_from_slice(&[0x00, 0x00]); // Urgent pointer
        segment.extend_from_slice(&self.payload);
        segment
    }
}

/// Builder for UDP datagrams.
#[derive(Debug, Clone)]
pub struct UdpBuilder {
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

impl Default for UdpBuilder {
    fn default() -> Self {
        Self {
            src_port: 12345,
            dst_port: 53,
            payload: Vec::new(),
        }
    }
}

impl UdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let length = 8 + self.payload.len() as u16;
        let mut datagram = Vec::with_capacity(length as usize);
        datagram.extend_from_slice(&self.src_port.to_be_bytes());
        datagram.extend_from_slice(&self.dst_port.to_be_bytes());
        datagram.extend_from_slice(&length.to_be_bytes());
        datagram.extend_from_slice(&[0x00, 0x00]); // Checksum
        datagram.extend_from_slice(&self.payload);
        datagram
    }
}

/// Builder for ICMP messages. Defaults to an echo request.
#[derive(Debug, Clone)]
pub struct IcmpBuilder {
    icmp_type: u8,
    code: u8,
    rest: [u8; 4],
    payload: Vec<u8>,
}

impl Default for IcmpBuilder {
    fn default() -> Self {
        Self {
            icmp_type: 8,
            code: 0,
            rest: [0x00, 0x01, 0x00, 0x01], // ID=1, Seq=1
            payload: Vec::new(),
        }
    }
}

impl IcmpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination_unreachable(mut self, code: u8) -> Self {
        self.icmp_type = 3;
        self.code = code;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut message = Vec::with_capacity(8 + self.payload.len());
        message.push(self.icmp_type);
        message.push(self.code);
        message.extend_from_slice(&[0x00, 0x00]); // Checksum
        message.extend_from_slice(&self.rest);
        message.extend_from_slice(&self.payload);
        message
    }
}
