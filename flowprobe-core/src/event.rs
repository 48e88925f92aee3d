//! Events emitted by the dispatch pipeline.
//!
//! Every event carries the context that produced it, so consumers can walk
//! its ancestry for addressing, and the capture timestamp of the packet that
//! completed it.

use std::sync::Arc;

use crate::address::ProtocolTag;
use crate::context::ContextNode;
use crate::decoders::dns::DnsMessage;
use crate::decoders::ntp::{NtpControl, NtpPrivate, NtpTimestamp};

/// Ordered header list, as it appeared on the wire.
pub type Headers = Vec<(String, String)>;

/// One decoded protocol unit.
#[derive(Debug, Clone)]
pub struct Event {
    pub context: Arc<ContextNode>,
    /// Capture time of the packet that completed this unit.
    pub timestamp_us: i64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(context: Arc<ContextNode>, timestamp_us: i64, payload: EventPayload) -> Self {
        Self {
            context,
            timestamp_us,
            payload,
        }
    }
}

/// The closed set of event kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ConnectionUp,
    ConnectionDown,

    /// Stream bytes no decoder claimed. `position` is the stream offset of
    /// the first byte.
    UnrecognisedStream { data: Vec<u8>, position: u64 },
    UnrecognisedDatagram { data: Vec<u8> },
    UnrecognisedIpProtocol { protocol: u8, data: Vec<u8> },

    Icmp { kind: u8, code: u8, data: Vec<u8> },

    HttpRequest {
        method: String,
        url: String,
        headers: Headers,
        body: Vec<u8>,
    },
    HttpResponse {
        code: u16,
        status: String,
        headers: Headers,
        /// URL of the request this answers, when the request was seen.
        url: Option<String>,
        body: Vec<u8>,
    },

    DnsMessage(DnsMessage),

    SmtpCommand { command: String },
    SmtpResponse { status: u16, text: Vec<String> },
    SmtpData {
        from: String,
        to: Vec<String>,
        data: Vec<u8>,
    },

    FtpCommand { command: String },
    FtpResponse { status: u16, text: Vec<String> },

    SipRequest {
        method: String,
        from: String,
        to: String,
        data: Vec<u8>,
    },
    SipResponse {
        code: u16,
        status: String,
        from: String,
        to: String,
        data: Vec<u8>,
    },

    Rtp { data: Vec<u8> },

    /// Payload of a service that is recognised by port but not decoded.
    Opaque { protocol: ProtocolTag, data: Vec<u8> },

    TlsClientHello {
        version: u16,
        cipher_suites: Vec<u16>,
        server_name: Option<String>,
        alpn: Vec<String>,
    },
    TlsServerHello { version: u16, cipher_suite: u16 },
    TlsCertificates { certificates: Vec<Vec<u8>> },
    TlsServerHelloDone,
    TlsHandshake { msg_type: u8 },
    TlsChangeCipherSpec,
    TlsApplicationData { length: usize },
    TlsAlert { level: u8, description: u8 },
    TlsUnknown { content_type: u8 },

    NtpTimestamp(NtpTimestamp),
    NtpControl(NtpControl),
    NtpPrivate(NtpPrivate),

    Gre {
        next_proto: u16,
        key: Option<u32>,
        sequence: Option<u32>,
        data: Vec<u8>,
    },
    GrePptp {
        call_id: u16,
        sequence: Option<u32>,
        ack: Option<u32>,
        data: Vec<u8>,
    },
    Esp { spi: u32, sequence: u32, length: usize },
}

impl EventPayload {
    /// Short snake_case name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::ConnectionUp => "connection_up",
            EventPayload::ConnectionDown => "connection_down",
            EventPayload::UnrecognisedStream { .. } => "unrecognised_stream",
            EventPayload::UnrecognisedDatagram { .. } => "unrecognised_datagram",
            EventPayload::UnrecognisedIpProtocol { .. } => "unrecognised_ip_protocol",
            EventPayload::Icmp { .. } => "icmp",
            EventPayload::HttpRequest { .. } => "http_request",
            EventPayload::HttpResponse { .. } => "http_response",
            EventPayload::DnsMessage(_) => "dns_message",
            EventPayload::SmtpCommand { .. } => "smtp_command",
            EventPayload::SmtpResponse { .. } => "smtp_response",
            EventPayload::SmtpData { .. } => "smtp_data",
            EventPayload::FtpCommand { .. } => "ftp_command",
            EventPayload::FtpResponse { .. } => "ftp_response",
            EventPayload::SipRequest { .. } => "sip_request",
            EventPayload::SipResponse { .. } => "sip_response",
            EventPayload::Rtp { .. } => "rtp",
            EventPayload::Opaque { .. } => "opaque",
            EventPayload::TlsClientHello { .. } => "tls_client_hello",
            EventPayload::TlsServerHello { .. } => "tls_server_hello",
            EventPayload::TlsCertificates { .. } => "tls_certificates",
            EventPayload::TlsServerHelloDone => "tls_server_hello_done",
            EventPayload::TlsHandshake { .. } => "tls_handshake",
            EventPayload::TlsChangeCipherSpec => "tls_change_cipher_spec",
            EventPayload::TlsApplicationData { .. } => "tls_application_data",
            EventPayload::TlsAlert { .. } => "tls_alert",
            EventPayload::TlsUnknown { .. } => "tls_unknown",
            EventPayload::NtpTimestamp(_) => "ntp_timestamp",
            EventPayload::NtpControl(_) => "ntp_control",
            EventPayload::NtpPrivate(_) => "ntp_private",
            EventPayload::Gre { .. } => "gre",
            EventPayload::GrePptp { .. } => "gre_pptp",
            EventPayload::Esp { .. } => "esp",
        }
    }

    /// Raw payload bytes carried by the event, if any.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            EventPayload::UnrecognisedStream { data, .. }
            | EventPayload::UnrecognisedDatagram { data }
            | EventPayload::UnrecognisedIpProtocol { data, .. }
            | EventPayload::Icmp { data, .. }
            | EventPayload::SmtpData { data, .. }
            | EventPayload::SipRequest { data, .. }
            | EventPayload::SipResponse { data, .. }
            | EventPayload::Rtp { data }
            | EventPayload::Opaque { data, .. }
            | EventPayload::Gre { data, .. }
            | EventPayload::GrePptp { data, .. } => Some(data),
            EventPayload::HttpRequest { body, .. } | EventPayload::HttpResponse { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }
}
