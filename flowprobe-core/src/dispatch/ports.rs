//! Port-number to decoder tables.
//!
//! Each engine owns one table for TCP and one for UDP. Tables are mutable at
//! runtime so a decoder can bind a port it learned about (SIP negotiating an
//! RTP port, for example).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::Pdu;
use crate::context::ContextNode;
use crate::decoders::{dns, ftp, http, ntp, opaque, rtp, sip, smtp, tls, unrecognised};
use crate::engine::Engine;
use crate::error::Result;

/// Entry point of an application decoder. The context is the transport
/// context the bytes arrived on.
pub type DecodeFn = fn(&Engine, &Arc<ContextNode>, Pdu<'_>) -> Result<()>;

/// A named decoder entry point.
#[derive(Clone, Copy)]
pub struct Handler {
    pub name: &'static str,
    pub decode: DecodeFn,
}

impl Handler {
    pub const fn new(name: &'static str, decode: DecodeFn) -> Self {
        Self { name, decode }
    }

    pub fn call(&self, engine: &Engine, context: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
        (self.decode)(engine, context, pdu)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// The built-in decoders.
pub mod handlers {
    use super::*;

    pub const HTTP_REQUEST: Handler = Handler::new("http_request", http::process_request);
    pub const HTTP_RESPONSE: Handler = Handler::new("http_response", http::process_response);
    pub const UNRECOGNISED_STREAM: Handler =
        Handler::new("unrecognised_stream", unrecognised::process_stream);
    pub const UNRECOGNISED_DATAGRAM: Handler =
        Handler::new("unrecognised_datagram", unrecognised::process_datagram);
    pub const FTP: Handler = Handler::new("ftp", ftp::process);
    pub const SMTP: Handler = Handler::new("smtp", smtp::process);
    pub const SMTP_AUTH: Handler = Handler::new("smtp_auth", opaque::process_smtp_auth);
    pub const POP3: Handler = Handler::new("pop3", opaque::process_pop3);
    pub const POP3_SSL: Handler = Handler::new("pop3_ssl", opaque::process_pop3_ssl);
    pub const IMAP: Handler = Handler::new("imap", opaque::process_imap);
    pub const IMAP_SSL: Handler = Handler::new("imap_ssl", opaque::process_imap_ssl);
    pub const SIP: Handler = Handler::new("sip", sip::process);
    pub const SIP_SSL: Handler = Handler::new("sip_ssl", opaque::process_sip_ssl);
    pub const TLS: Handler = Handler::new("tls", tls::process);
    pub const DNS_UDP: Handler = Handler::new("dns", dns::process_udp);
    pub const DNS_TCP: Handler = Handler::new("dns_tcp", dns::process_tcp);
    pub const NTP: Handler = Handler::new("ntp", ntp::process);
    pub const RTP: Handler = Handler::new("rtp", rtp::process);
}

const PORT_COUNT: usize = u16::MAX as usize + 1;

/// A fixed-size `port -> handler` table.
pub struct PortTable {
    handlers: RwLock<Vec<Option<Handler>>>,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PortTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.handlers.read().iter().filter(|h| h.is_some()).count();
        f.debug_struct("PortTable").field("bound", &bound).finish()
    }
}

impl PortTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(vec![None; PORT_COUNT]),
        }
    }

    /// The default TCP bindings.
    pub fn tcp_defaults() -> Self {
        Self::with_bindings(&[
            (21, handlers::FTP),
            (25, handlers::SMTP),
            (110, handlers::POP3),
            (220, handlers::IMAP),
            (443, handlers::TLS),
            (465, handlers::SMTP_AUTH),
            (993, handlers::IMAP_SSL),
            (995, handlers::POP3_SSL),
            (5060, handlers::SIP),
            (5061, handlers::SIP_SSL),
        ])
    }

    /// The default UDP bindings.
    pub fn udp_defaults() -> Self {
        Self::with_bindings(&[
            (53, handlers::DNS_UDP),
            (123, handlers::NTP),
            (5060, handlers::SIP),
            (5061, handlers::SIP_SSL),
        ])
    }

    fn with_bindings(bindings: &[(u16, Handler)]) -> Self {
        let table = Self::new();
        for (port, handler) in bindings {
            table.add(*port, *handler);
        }
        table
    }

    /// Bind `port`. An existing binding is left alone; returns whether the
    /// new handler was installed.
    pub fn add(&self, port: u16, handler: Handler) -> bool {
        let mut handlers = self.handlers.write();
        let slot = &mut handlers[port as usize];
        if slot.is_some() {
            return false;
        }
        debug!(port, handler = handler.name, "port handler added");
        *slot = Some(handler);
        true
    }

    /// Unbind `port`, returning what was bound.
    pub fn remove(&self, port: u16) -> Option<Handler> {
        self.handlers.write()[port as usize].take()
    }

    pub fn get(&self, port: u16) -> Option<Handler> {
        self.handlers.read()[port as usize]
    }

    pub fn contains(&self, port: u16) -> bool {
        self.get(port).is_some()
    }

    /// Handler for a flow: the source port is consulted first.
    pub fn lookup(&self, src: u16, dest: u16) -> Option<Handler> {
        let handlers = self.handlers.read();
        handlers[src as usize].or(handlers[dest as usize])
    }
}
