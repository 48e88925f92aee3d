//! SMTP client and server decoders.
//!
//! The client side tracks the envelope (`MAIL FROM`, `RCPT TO`) and
//! collects message data after `DATA` up to the lone `.` line, undoing dot
//! stuffing. The server side reports replies, multi-line replies whole.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use super::lines::{CommandParser, ResponseParser};
use super::{app_context, dest_port};
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::ports::handlers;
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const PROTOCOL: &str = "SMTP";

/// Largest message body collected after `DATA`.
pub const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// CR LF, dot, CR LF.
const END_OF_DATA: &[u8] = b"\r\n.\r\n";

#[derive(Debug)]
enum Mode {
    Command,
    Data,
}

/// Client-side SMTP state.
#[derive(Debug)]
pub struct SmtpClientState {
    commands: CommandParser,
    mode: Mode,
    from: String,
    to: Vec<String>,
    data: Vec<u8>,
}

impl Default for SmtpClientState {
    fn default() -> Self {
        Self {
            commands: CommandParser::new(PROTOCOL),
            mode: Mode::Command,
            from: String::new(),
            to: Vec::new(),
            data: Vec::new(),
        }
    }
}

fn mail_from() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^ *MAIL +FROM *: *<([^ >]*)>").ok())
        .as_ref()
}

fn rcpt_to() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^ *RCPT +TO *: *<([^ >]*)>").ok())
        .as_ref()
}

fn capture(pattern: Option<&Regex>, line: &str) -> Option<String> {
    let caps = pattern?.captures(line)?;
    caps.get(1).map(|m| m.as_str().to_string())
}

impl SmtpClientState {
    /// Consume client bytes, appending events for each completed command
    /// and message.
    pub fn parse(&mut self, data: &[u8], events: &mut Vec<EventPayload>) -> std::result::Result<(), ProtocolError> {
        for &byte in data {
            match self.mode {
                Mode::Command => {
                    if let Some(command) = self.commands.push(byte)? {
                        self.command(command, events);
                    }
                }
                Mode::Data => {
                    if self.data.len() >= MAX_MESSAGE {
                        return Err(ProtocolError::violation(PROTOCOL, "message data too large"));
                    }
                    self.data.push(byte);
                    if self.data.ends_with(END_OF_DATA) {
                        self.end_of_data(events);
                    }
                }
            }
        }
        Ok(())
    }

    fn command(&mut self, command: String, events: &mut Vec<EventPayload>) {
        let verb = command.trim_start().split(' ').next().unwrap_or_default().to_ascii_uppercase();
        match verb.as_str() {
            "MAIL" => {
                if let Some(from) = capture(mail_from(), &command) {
                    self.from = from;
                    self.to.clear();
                }
            }
            "RCPT" => {
                if let Some(to) = capture(rcpt_to(), &command) {
                    self.to.push(to);
                }
            }
            "DATA" => {
                self.mode = Mode::Data;
                // Seed with CR LF so an empty message still ends on the
                // terminator.
                self.data.clear();
                self.data.extend_from_slice(b"\r\n");
            }
            "RSET" => {
                self.from.clear();
                self.to.clear();
            }
            _ => {}
        }
        events.push(EventPayload::SmtpCommand { command });
    }

    fn end_of_data(&mut self, events: &mut Vec<EventPayload>) {
        let end = self.data.len() - END_OF_DATA.len();
        self.data.truncate(end);
        let body = self.data.get(2..).unwrap_or_default();
        events.push(EventPayload::SmtpData {
            from: std::mem::take(&mut self.from),
            to: std::mem::take(&mut self.to),
            data: unstuff(body),
        });
        self.data.clear();
        self.mode = Mode::Command;
    }
}

/// Remove the leading dot added to message lines that begin with one.
fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut line_start = true;
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if line_start && b == b'.' {
            // Skip the stuffed dot.
            i += 1;
            line_start = false;
            continue;
        }
        out.push(b);
        line_start = b == b'\n';
        i += 1;
    }
    out
}

/// Entry point for the SMTP port: the side sending to the bound port is the
/// client.
pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let to_server = dest_port(transport)
        .and_then(|port| engine.tcp_ports().get(port))
        .is_some_and(|h| h == handlers::SMTP);
    if to_server {
        process_client(engine, transport, pdu)
    } else {
        process_server(engine, transport, pdu)
    }
}

pub fn process_client(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Smtp, pdu.direction, || {
        ContextState::SmtpClient(SmtpClientState::default())
    });

    let mut events = Vec::new();
    let result = match &mut *context.state() {
        ContextState::SmtpClient(client) => client.parse(pdu.data, &mut events),
        _ => Ok(()),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}

pub fn process_server(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Smtp, pdu.direction, || {
        ContextState::SmtpServer(ResponseParser::new(PROTOCOL))
    });

    let mut events = Vec::new();
    let result: std::result::Result<(), ProtocolError> = match &mut *context.state() {
        ContextState::SmtpServer(replies) => pdu.data.iter().try_for_each(|&b| {
            if let Some(reply) = replies.push(b)? {
                events.push(EventPayload::SmtpResponse {
                    status: reply.status,
                    text: reply.text,
                });
            }
            Ok(())
        }),
        _ => Ok(()),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}
