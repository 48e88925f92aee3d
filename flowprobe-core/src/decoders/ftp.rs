//! FTP control channel decoder.

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use super::lines::{CommandParser, ResponseParser};
use super::{app_context, dest_port};
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::ports::handlers;
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const PROTOCOL: &str = "FTP";

/// Reply code for "Entering Passive Mode (h1,h2,h3,h4,p1,p2)".
const PASSIVE_MODE: u16 = 227;

fn passive_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\((\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})\)").ok())
        .as_ref()
}

/// Data-channel address announced by a 227 reply.
pub fn passive_address(text: &str) -> Option<(Ipv4Addr, u16)> {
    let caps = passive_pattern()?.captures(text)?;
    let mut parts = [0u8; 6];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    let [a, b, c, d, hi, lo] = parts;
    Some((Ipv4Addr::new(a, b, c, d), u16::from_be_bytes([hi, lo])))
}

/// Entry point for the FTP port: the side sending to the bound port is the
/// client.
pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let to_server = dest_port(transport)
        .and_then(|port| engine.tcp_ports().get(port))
        .is_some_and(|h| h == handlers::FTP);
    if to_server {
        process_client(engine, transport, pdu)
    } else {
        process_server(engine, transport, pdu)
    }
}

pub fn process_client(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Ftp, pdu.direction, || {
        ContextState::FtpClient(CommandParser::new(PROTOCOL))
    });

    let mut events = Vec::new();
    let result: std::result::Result<(), ProtocolError> = match &mut *context.state() {
        ContextState::FtpClient(commands) => pdu.data.iter().try_for_each(|&b| {
            if let Some(command) = commands.push(b)? {
                events.push(EventPayload::FtpCommand { command });
            }
            Ok(())
        }),
        _ => Ok(()),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}

pub fn process_server(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Ftp, pdu.direction, || {
        ContextState::FtpServer(ResponseParser::new(PROTOCOL))
    });

    let mut events = Vec::new();
    let result: std::result::Result<(), ProtocolError> = match &mut *context.state() {
        ContextState::FtpServer(replies) => pdu.data.iter().try_for_each(|&b| {
            if let Some(reply) = replies.push(b)? {
                if reply.status == PASSIVE_MODE {
                    if let Some((addr, port)) = reply.text.last().and_then(|t| passive_address(t)) {
                        debug!(context = context.id(), %addr, port, "ftp passive mode");
                    }
                }
                events.push(EventPayload::FtpResponse {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Direction;
    use crate::config::EngineConfig;
    use crate::sink::VecSink;
    use crate::test_utils::{Ipv4Builder, TcpBuilder};

    #[test]
    fn test_passive_address() {
        assert_eq!(
            passive_address("Entering Passive Mode (192,168,1,10,195,80)."),
            Some((Ipv4Addr::new(192, 168, 1, 10), 50000))
        );
        assert_eq!(passive_address("Entering Passive Mode"), None);
        assert_eq!(passive_address("(300,1,1,1,1,1)"), None);
    }

    // Test 1: Commands and replies in both directions of one control channel
    #[test]
    fn test_control_channel() {
        let sink = Arc::new(VecSink::new());
        let engine = Engine::new(EngineConfig::default(), sink.clone());
        let client = [10, 0, 0, 1];
        let server = [10, 0, 0, 2];
        let send = |from_client: bool, tcp: TcpBuilder| {
            let (src, dst) = if from_client { (client, server) } else { (server, client) };
            let packet = Ipv4Builder::new().tcp().src_ip(src).dst_ip(dst).payload(tcp.build()).build();
            engine.handle("eth0", "net", Direction::NotKnown, 0, &packet).unwrap();
        };

        send(true, TcpBuilder::new().src_port(40000).dst_port(21).seq(1).syn());
        send(false, TcpBuilder::new().src_port(21).dst_port(40000).seq(1).syn_ack().ack_num(2));
        send(false, TcpBuilder::new().src_port(21).dst_port(40000).seq(2).psh_ack().payload(
            b"220-Welcome\r\n220 ready\r\n".to_vec(),
        ));
        send(true, TcpBuilder::new().src_port(40000).dst_port(21).seq(2).psh_ack().payload(b"PASV\r\n".to_vec()));
        send(false, TcpBuilder::new().src_port(21).dst_port(40000).seq(26).psh_ack().payload(
            b"227 Entering Passive Mode (10,0,0,2,4,1)\r\n".to_vec(),
        ));

        let payloads: Vec<_> = sink
            .payloads()
            .into_iter()
            .filter(|p| p.name().starts_with("ftp"))
            .collect();
        assert_eq!(
            payloads,
            vec![
                EventPayload::FtpResponse {
                    status: 220,
                    text: vec!["Welcome".into(), "ready".into()]
                },
                EventPayload::FtpCommand { command: "PASV".into() },
                EventPayload::FtpResponse {
                    status: 227,
                    text: vec!["Entering Passive Mode (10,0,0,2,4,1)".into()]
                },
            ]
        );
    }
}
