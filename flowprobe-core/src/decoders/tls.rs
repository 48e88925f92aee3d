//! TLS record and handshake decoder (metadata only, no decryption).
//!
//! Records are buffered across segments and handshake messages across
//! records. The cipher suite chosen in ServerHello is recorded on both
//! directions of the connection.

use std::sync::Arc;

use super::app_context;
use crate::address::ProtocolTag;
use crate::context::{ContextKind, ContextNode, ContextState};
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const PROTOCOL: &str = "TLS";

const RECORD_HEADER: usize = 5;
/// 2^14 plaintext plus the largest expansion allowed for ciphertext.
const MAX_RECORD: usize = 16384 + 2048;
const MAX_HANDSHAKE: usize = 1024 * 1024;

/// TLS content types.
pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

/// TLS handshake types.
pub mod handshake_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

mod extension {
    pub const SERVER_NAME: u16 = 0;
    pub const ALPN: u16 = 16;
}

type ParseResult<T> = std::result::Result<T, ProtocolError>;

/// Per-direction TLS state.
#[derive(Debug, Default)]
pub struct TlsState {
    records: Vec<u8>,
    handshake: Vec<u8>,
    cipher_suite: Option<u16>,
    /// Set after ChangeCipherSpec: later handshake and alert records are
    /// encrypted.
    encrypted: bool,
}

impl TlsState {
    /// The negotiated cipher suite, once either side has seen ServerHello.
    pub fn cipher_suite(&self) -> Option<u16> {
        self.cipher_suite
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn parse(&mut self, data: &[u8], events: &mut Vec<EventPayload>) -> ParseResult<()> {
        self.records.extend_from_slice(data);

        let mut pos = 0;
        let result = loop {
            let Some(header) = self.records.get(pos..pos + RECORD_HEADER) else {
                break Ok(());
            };
            let content = header[0];
            let major = header[1];
            let length = u16::from_be_bytes([header[3], header[4]]) as usize;
            if major != 3 {
                break Err(ProtocolError::violation(PROTOCOL, format!("record version {major}.x")));
            }
            if length > MAX_RECORD {
                break Err(ProtocolError::violation(PROTOCOL, format!("record of {length} bytes")));
            }
            let start = pos + RECORD_HEADER;
            if self.records.len() < start + length {
                break Ok(());
            }
            let fragment = self.records[start..start + length].to_vec();
            pos = start + length;

            if let Err(e) = self.record(content, &fragment, events) {
                break Err(e);
            }
        };
        self.records.drain(..pos);
        result
    }

    fn record(&mut self, content: u8, fragment: &[u8], events: &mut Vec<EventPayload>) -> ParseResult<()> {
        match content {
            content_type::HANDSHAKE if !self.encrypted => {
                if self.handshake.len() + fragment.len() > MAX_HANDSHAKE {
                    return Err(ProtocolError::violation(PROTOCOL, "handshake message too large"));
                }
                self.handshake.extend_from_slice(fragment);
                self.handshake_messages(events)
            }
            content_type::CHANGE_CIPHER_SPEC => {
                self.encrypted = true;
                events.push(EventPayload::TlsChangeCipherSpec);
                Ok(())
            }
            content_type::APPLICATION_DATA => {
                events.push(EventPayload::TlsApplicationData {
                    length: fragment.len(),
                });
                Ok(())
            }
            content_type::ALERT if !self.encrypted && fragment.len() >= 2 => {
                events.push(EventPayload::TlsAlert {
                    level: fragment[0],
                    description: fragment[1],
                });
                Ok(())
            }
            // Encrypted handshake and alert records are opaque.
            other => {
                events.push(EventPayload::TlsUnknown { content_type: other });
                Ok(())
            }
        }
    }

    fn handshake_messages(&mut self, events: &mut Vec<EventPayload>) -> ParseResult<()> {
        let mut pos = 0;
        while let Some(header) = self.handshake.get(pos..pos + 4) {
            let msg_type = header[0];
            let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
            let Some(body) = self.handshake.get(pos + 4..pos + 4 + len) else {
                break;
            };
            let event = match msg_type {
                handshake_type::CLIENT_HELLO => parse_client_hello(body)?,
                handshake_type::SERVER_HELLO => {
                    let event = parse_server_hello(body)?;
                    if let EventPayload::TlsServerHello { cipher_suite, .. } = event {
                        self.cipher_suite = Some(cipher_suite);
                    }
                    event
                }
                handshake_type::CERTIFICATE => parse_certificates(body)?,
                handshake_type::SERVER_HELLO_DONE => EventPayload::TlsServerHelloDone,
                other => EventPayload::TlsHandshake { msg_type: other },
            };
            events.push(event);
            pos += 4 + len;
        }
        self.handshake.drain(..pos);
        Ok(())
    }
}

/// Bounds-checked cursor over a handshake body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| ProtocolError::too_short(PROTOCOL, self.pos + n, self.data.len()))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> ParseResult<usize> {
        let b = self.take(3)?;
        Ok((usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn parse_client_hello(body: &[u8]) -> ParseResult<EventPayload> {
    let mut r = Reader::new(body);
    let version = r.u16()?;
    r.take(32)?;
    let session_len = r.u8()? as usize;
    r.take(session_len)?;
    let suites_len = r.u16()? as usize;
    let cipher_suites = r
        .take(suites_len)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    let compression_len = r.u8()? as usize;
    r.take(compression_len)?;

    let (server_name, alpn) = if r.is_empty() {
        (None, Vec::new())
    } else {
        let ext_len = r.u16()? as usize;
        let extensions = r.take(ext_len)?;
        (extract_sni(extensions), extract_alpn(extensions))
    };

    Ok(EventPayload::TlsClientHello {
        version,
        cipher_suites,
        server_name,
        alpn,
    })
}

fn parse_server_hello(body: &[u8]) -> ParseResult<EventPayload> {
    let mut r = Reader::new(body);
    let version = r.u16()?;
    r.take(32)?;
    let session_len = r.u8()? as usize;
    r.take(session_len)?;
    let cipher_suite = r.u16()?;
    Ok(EventPayload::TlsServerHello {
        version,
        cipher_suite,
    })
}

fn parse_certificates(body: &[u8]) -> ParseResult<EventPayload> {
    let mut r = Reader::new(body);
    let total = r.u24()?;
    let mut list = Reader::new(r.take(total)?);
    let mut certificates = Vec::new();
    while !list.is_empty() {
        let len = list.u24()?;
        certificates.push(list.take(len)?.to_vec());
    }
    Ok(EventPayload::TlsCertificates { certificates })
}

/// Walk the extension list, returning the body of the first extension of
/// type `wanted`.
fn find_extension(extensions: &[u8], wanted: u16) -> Option<&[u8]> {
    let mut pos = 0;
    while pos + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[pos], extensions[pos + 1]]);
        let ext_len = u16::from_be_bytes([extensions[pos + 2], extensions[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions.len() {
            break;
        }
        if ext_type == wanted {
            return Some(&extensions[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    None
}

/// Extract SNI from ClientHello extensions.
fn extract_sni(extensions: &[u8]) -> Option<String> {
    let ext_data = find_extension(extensions, extension::SERVER_NAME)?;
    if ext_data.len() < 5 {
        return None;
    }
    let name_len = u16::from_be_bytes([ext_data[3], ext_data[4]]) as usize;
    let name = ext_data.get(5..5 + name_len)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}

/// Extract the offered ALPN protocol names.
fn extract_alpn(extensions: &[u8]) -> Vec<String> {
    let Some(ext_data) = find_extension(extensions, extension::ALPN) else {
        return Vec::new();
    };
    let mut protocols = Vec::new();
    let mut pos = 2;
    while let Some(&len) = ext_data.get(pos) {
        let Some(name) = ext_data.get(pos + 1..pos + 1 + len as usize) else {
            break;
        };
        if let Ok(name) = std::str::from_utf8(name) {
            protocols.push(name.to_string());
        }
        pos += 1 + len as usize;
    }
    protocols
}

pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Tls, pdu.direction, || {
        ContextState::Tls(TlsState::default())
    });

    let mut events = Vec::new();
    let (result, negotiated) = match &mut *context.state() {
        ContextState::Tls(tls) => {
            let before = tls.cipher_suite;
            let result = tls.parse(pdu.data, &mut events);
            let negotiated = tls.cipher_suite.filter(|_| tls.cipher_suite != before);
            (result, negotiated)
        }
        _ => (Ok(()), None),
    };

    if let Some(suite) = negotiated {
        share_cipher_suite(&context, suite);
    }
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}

fn share_cipher_suite(context: &Arc<ContextNode>, suite: u16) {
    let Some(peer) = context.reverse().filter(|p| p.kind() == ContextKind::Tls) else {
        return;
    };
    let mut state = peer.state();
    if let ContextState::Tls(tls) = &mut *state {
        tls.cipher_suite = Some(suite);
    }
}
