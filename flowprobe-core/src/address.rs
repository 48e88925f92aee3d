//! Endpoint and flow addressing.
//!
//! An [`Address`] names one endpoint at one protocol layer (an IPv4 address,
//! a TCP port, a DNS transaction id). A [`FlowAddress`] pairs two endpoints
//! and is the key that distinguishes sibling contexts under one parent.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use smallvec::SmallVec;

/// The layer an address belongs to.
///
/// Declaration order is the ordering used when comparing addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Purpose {
    Root,
    Link,
    Network,
    Transport,
    Service,
    Application,
    Control,
    #[default]
    NotSpecified,
}

/// Protocol carried by an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProtocolTag {
    #[default]
    NoProtocol,
    Ip4,
    Ip6,
    Tcp,
    Udp,
    Icmp,
    Http,
    Dns,
    Smtp,
    Ftp,
    Ntp,
    Imap,
    ImapSsl,
    Pop3,
    Pop3Ssl,
    Rtp,
    RtpSsl,
    Sip,
    SipSsl,
    SmtpAuth,
    Gre,
    Esp,
    Tls,
    Unrecognised,
}

impl ProtocolTag {
    /// Short lowercase name used in context descriptions.
    pub fn name(self) -> &'static str {
        match self {
            ProtocolTag::NoProtocol => "none",
            ProtocolTag::Ip4 => "ipv4",
            ProtocolTag::Ip6 => "ipv6",
            ProtocolTag::Tcp => "tcp",
            ProtocolTag::Udp => "udp",
            ProtocolTag::Icmp => "icmp",
            ProtocolTag::Http => "http",
            ProtocolTag::Dns => "dns",
            ProtocolTag::Smtp => "smtp",
            ProtocolTag::Ftp => "ftp",
            ProtocolTag::Ntp => "ntp",
            ProtocolTag::Imap => "imap",
            ProtocolTag::ImapSsl => "imap_ssl",
            ProtocolTag::Pop3 => "pop3",
            ProtocolTag::Pop3Ssl => "pop3_ssl",
            ProtocolTag::Rtp => "rtp",
            ProtocolTag::RtpSsl => "rtp_ssl",
            ProtocolTag::Sip => "sip",
            ProtocolTag::SipSsl => "sip_ssl",
            ProtocolTag::SmtpAuth => "smtp_auth",
            ProtocolTag::Gre => "gre",
            ProtocolTag::Esp => "esp",
            ProtocolTag::Tls => "tls",
            ProtocolTag::Unrecognised => "unrecognised",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One endpoint at one protocol layer.
///
/// Field order matters: the derived ordering is lexicographic on
/// `(layer, protocol, bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address {
    pub layer: Purpose,
    pub protocol: ProtocolTag,
    pub bytes: SmallVec<[u8; 16]>,
}

impl Address {
    pub fn new(layer: Purpose, protocol: ProtocolTag, bytes: &[u8]) -> Self {
        Self {
            layer,
            protocol,
            bytes: SmallVec::from_slice(bytes),
        }
    }

    /// An address with no bytes, used for per-direction singleton contexts.
    pub fn sentinel(layer: Purpose, protocol: ProtocolTag) -> Self {
        Self::new(layer, protocol, &[])
    }

    /// A transport-layer port address.
    pub fn port(protocol: ProtocolTag, port: u16) -> Self {
        Self::new(Purpose::Transport, protocol, &port.to_be_bytes())
    }

    /// True for the default value: no bytes and no protocol.
    pub fn is_unset(&self) -> bool {
        self.bytes.is_empty() && self.protocol == ProtocolTag::NoProtocol
    }

    /// Interpret a two-byte address as a big-endian integer (port numbers).
    pub fn as_u16(&self) -> Option<u16> {
        match self.bytes.as_slice() {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Interpret the address as an IP address, if it is one.
    pub fn as_ip(&self) -> Option<std::net::IpAddr> {
        match self.bytes.len() {
            4 => {
                let octets: [u8; 4] = self.bytes.as_slice().try_into().ok()?;
                Some(Ipv4Addr::from(octets).into())
            }
            16 => {
                let octets: [u8; 16] = self.bytes.as_slice().try_into().ok()?;
                Some(Ipv6Addr::from(octets).into())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.protocol, self.bytes.len()) {
            (ProtocolTag::Ip4, 4) | (ProtocolTag::Ip6, 16) => match self.as_ip() {
                Some(ip) => write!(f, "{ip}"),
                None => f.write_str(self.protocol.name()),
            },
            (ProtocolTag::Tcp | ProtocolTag::Udp, 2) => match self.as_u16() {
                Some(port) => write!(f, "{port}"),
                None => f.write_str(self.protocol.name()),
            },
            (_, 0) => f.write_str(self.protocol.name()),
            _ => {
                for b in &self.bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Which side of the monitored target a packet travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    ToTarget,
    FromTarget,
    #[default]
    NotKnown,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToTarget => Direction::FromTarget,
            Direction::FromTarget => Direction::ToTarget,
            Direction::NotKnown => Direction::NotKnown,
        }
    }
}

/// A directional pair of endpoints.
///
/// Equality, ordering and hashing consider only `src` and `dest`: the same
/// pair seen with a different direction annotation is the same flow.
#[derive(Debug, Clone, Default)]
pub struct FlowAddress {
    pub src: Address,
    pub dest: Address,
    pub direction: Direction,
}

impl FlowAddress {
    pub fn new(src: Address, dest: Address, direction: Direction) -> Self {
        Self {
            src,
            dest,
            direction,
        }
    }

    /// Both endpoints set to the same sentinel address.
    pub fn sentinel(layer: Purpose, protocol: ProtocolTag, direction: Direction) -> Self {
        let addr = Address::sentinel(layer, protocol);
        Self::new(addr.clone(), addr, direction)
    }

    /// The mirrored address used to find the opposite direction of a flow.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dest.clone(),
            dest: self.src.clone(),
            direction: self.direction.reverse(),
        }
    }
}

impl PartialEq for FlowAddress {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src && self.dest == other.dest
    }
}

impl Eq for FlowAddress {}

impl PartialOrd for FlowAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.src
            .cmp(&other.src)
            .then_with(|| self.dest.cmp(&other.dest))
    }
}

impl Hash for FlowAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.src.hash(state);
        self.dest.hash(state);
    }
}

impl fmt::Display for FlowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dest)
    }
}
