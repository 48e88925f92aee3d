//! SIP decoder.
//!
//! Each datagram (or TCP segment) is taken as one SIP message. An INVITE
//! whose SDP body announces audio or video media binds the RTP decoder to
//! the announced ports in both port tables.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use super::app_context;
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::ports::handlers;
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const PROTOCOL: &str = "SIP";

struct Patterns {
    request: Regex,
    response: Regex,
    media: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                request: Regex::new(r"^([A-Z]+) ([^ ]+) SIP/2\.0\r?$").ok()?,
                response: Regex::new(r"^SIP/2\.0 (\d{3}) ([^\r]*)\r?$").ok()?,
                media: Regex::new(r"(?m)^m=(?:audio|video) (\d+) RTP").ok()?,
            })
        })
        .as_ref()
}

/// First line of a SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StartLine {
    Request { method: String },
    Response { code: u16, status: String },
}

/// A parsed SIP message: start line, From/To and announced media ports.
#[derive(Debug)]
struct SipMessage {
    start: StartLine,
    from: String,
    to: String,
    media_ports: Vec<u16>,
}

/// The address part of a From/To value, `<...>` when present.
fn party(value: &str) -> String {
    match (value.find('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => value[open..=close].to_string(),
        _ => value.trim().to_string(),
    }
}

fn parse(data: &[u8]) -> std::result::Result<SipMessage, ProtocolError> {
    let patterns = patterns().ok_or_else(|| ProtocolError::violation(PROTOCOL, "patterns unavailable"))?;
    let text = String::from_utf8_lossy(data);
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    let mut lines = head.split('\n');
    let first = lines.next().unwrap_or_default();

    let start = if let Some(caps) = patterns.request.captures(first) {
        StartLine::Request {
            method: caps[1].to_string(),
        }
    } else if let Some(caps) = patterns.response.captures(first) {
        StartLine::Response {
            code: caps[1]
                .parse()
                .map_err(|_| ProtocolError::violation(PROTOCOL, "bad status code"))?,
            status: caps[2].to_string(),
        }
    } else {
        return Err(ProtocolError::violation(PROTOCOL, "unexpected start line"));
    };

    let mut from = String::new();
    let mut to = String::new();
    for line in lines {
        let Some((name, value)) = line.trim_end_matches('\r').split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "from" | "f" => from = party(value),
            "to" | "t" => to = party(value),
            _ => {}
        }
    }

    let media_ports = patterns
        .media
        .captures_iter(body)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();

    Ok(SipMessage {
        start,
        from,
        to,
        media_ports,
    })
}

pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let message = parse(pdu.data)?;
    let context = app_context(transport, ProtocolTag::Sip, pdu.direction, || ContextState::Sip);

    let event = match message.start {
        StartLine::Request { method } => {
            if method == "INVITE" {
                for &port in &message.media_ports {
                    debug!(context = context.id(), port, "sip media port");
                    engine.tcp_ports().add(port, handlers::RTP);
                    engine.udp_ports().add(port, handlers::RTP);
                }
            }
            EventPayload::SipRequest {
                method,
                from: message.from,
                to: message.to,
                data: pdu.data.to_vec(),
            }
        }
        StartLine::Response { code, status } => EventPayload::SipResponse {
            code,
            status,
            from: message.from,
            to: message.to,
            data: pdu.data.to_vec(),
        },
    };
    engine.emit(&context, pdu.timestamp_us, event);
    Ok(())
}
