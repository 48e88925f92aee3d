//! Per-kind context state.

use crate::address::{Address, ProtocolTag};
use crate::decoders::http::HttpState;
use crate::decoders::lines::{CommandParser, ResponseParser};
use crate::decoders::smtp::SmtpClientState;
use crate::decoders::tls::TlsState;
use crate::dispatch::tcp::TcpState;
use crate::reassembly::FragmentReassembler;

/// Kind of a context node, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Root,
    Ip4,
    Ip6,
    Tcp,
    Udp,
    Icmp,
    Gre,
    Esp,
    HttpRequest,
    HttpResponse,
    Dns,
    SmtpClient,
    SmtpServer,
    FtpClient,
    FtpServer,
    Sip,
    Rtp,
    Tls,
    Ntp,
    /// Payload passed through whole (IMAP, POP3, TLS-wrapped services).
    Opaque(ProtocolTag),
    UnrecognisedStream,
    UnrecognisedDatagram,
}

impl ContextKind {
    pub fn name(self) -> &'static str {
        match self {
            ContextKind::Root => "root",
            ContextKind::Ip4 => "ipv4",
            ContextKind::Ip6 => "ipv6",
            ContextKind::Tcp => "tcp",
            ContextKind::Udp => "udp",
            ContextKind::Icmp => "icmp",
            ContextKind::Gre => "gre",
            ContextKind::Esp => "esp",
            ContextKind::HttpRequest | ContextKind::HttpResponse => "http",
            ContextKind::Dns => "dns",
            ContextKind::SmtpClient | ContextKind::SmtpServer => "smtp",
            ContextKind::FtpClient | ContextKind::FtpServer => "ftp",
            ContextKind::Sip => "sip",
            ContextKind::Rtp => "rtp",
            ContextKind::Tls => "tls",
            ContextKind::Ntp => "ntp",
            ContextKind::Opaque(tag) => tag.name(),
            ContextKind::UnrecognisedStream | ContextKind::UnrecognisedDatagram => "unrecognised",
        }
    }
}

/// Identity of a root context: why this traffic was captured.
#[derive(Debug, Clone, Default)]
pub struct RootState {
    pub device: String,
    pub network: String,
    /// The target address that caused acquisition, if known.
    pub trigger_address: Option<Address>,
}

/// Mutable state carried by a context, one variant per kind.
#[derive(Debug)]
pub enum ContextState {
    Root(RootState),
    Ip4(FragmentReassembler),
    Ip6,
    Tcp(Box<TcpState>),
    Udp,
    Icmp,
    Gre,
    Esp,
    HttpRequest(Box<HttpState>),
    HttpResponse(Box<HttpState>),
    Dns,
    /// DNS over TCP: bytes of an incomplete length-prefixed message.
    DnsStream { buffer: Vec<u8> },
    SmtpClient(SmtpClientState),
    SmtpServer(ResponseParser),
    FtpClient(CommandParser),
    FtpServer(ResponseParser),
    Sip,
    Rtp,
    Tls(TlsState),
    Ntp,
    Opaque(ProtocolTag),
    UnrecognisedStream { position: u64 },
    UnrecognisedDatagram,
}

impl ContextState {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextState::Root(_) => ContextKind::Root,
            ContextState::Ip4(_) => ContextKind::Ip4,
            ContextState::Ip6 => ContextKind::Ip6,
            ContextState::Tcp(_) => ContextKind::Tcp,
            ContextState::Udp => ContextKind::Udp,
            ContextState::Icmp => ContextKind::Icmp,
            ContextState::Gre => ContextKind::Gre,
            ContextState::Esp => ContextKind::Esp,
            ContextState::HttpRequest(_) => ContextKind::HttpRequest,
            ContextState::HttpResponse(_) => ContextKind::HttpResponse,
            ContextState::Dns | ContextState::DnsStream { .. } => ContextKind::Dns,
            ContextState::SmtpClient(_) => ContextKind::SmtpClient,
            ContextState::SmtpServer(_) => ContextKind::SmtpServer,
            ContextState::FtpClient(_) => ContextKind::FtpClient,
            ContextState::FtpServer(_) => ContextKind::FtpServer,
            ContextState::Sip => ContextKind::Sip,
            ContextState::Rtp => ContextKind::Rtp,
            ContextState::Tls(_) => ContextKind::Tls,
            ContextState::Ntp => ContextKind::Ntp,
            ContextState::Opaque(tag) => ContextKind::Opaque(*tag),
            ContextState::UnrecognisedStream { .. } => ContextKind::UnrecognisedStream,
            ContextState::UnrecognisedDatagram => ContextKind::UnrecognisedDatagram,
        }
    }
}
