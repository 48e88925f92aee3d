//! Services recognised by port whose payload is passed through undecoded:
//! IMAP, POP3, authenticated SMTP and the TLS-wrapped variants.

use std::sync::Arc;

use super::app_context;
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::Result;
use crate::event::EventPayload;

fn process(engine: &Engine, transport: &Arc<ContextNode>, protocol: ProtocolTag, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, protocol, pdu.direction, || ContextState::Opaque(protocol));
    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::Opaque {
            protocol,
            data: pdu.data.to_vec(),
        },
    );
    Ok(())
}

pub fn process_smtp_auth(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::SmtpAuth, pdu)
}

pub fn process_pop3(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::Pop3, pdu)
}

pub fn process_pop3_ssl(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::Pop3Ssl, pdu)
}

pub fn process_imap(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::Imap, pdu)
}

pub fn process_imap_ssl(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::ImapSsl, pdu)
}

pub fn process_sip_ssl(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    process(engine, transport, ProtocolTag::SipSsl, pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Direction;
    use crate::config::EngineConfig;
    use crate::context::ContextKind;
    use crate::sink::VecSink;
    use crate::test_utils::{Ipv4Builder, TcpBuilder};

    #[test]
    fn test_imap_payload_passes_through() {
        let sink = Arc::new(VecSink::new());
        let engine = Engine::new(EngineConfig::default(), sink.clone());
        let send = |tcp: TcpBuilder| {
            let packet = Ipv4Builder::new().tcp().payload(tcp.build()).build();
            engine.handle("eth0", "net", Direction::NotKnown, 0, &packet).unwrap();
        };
        send(TcpBuilder::new().src_port(220).dst_port(41000).seq(7).syn());
        send(TcpBuilder::new().src_port(220).dst_port(41000).seq(8).psh_ack().payload(b"* OK ready\r\n".to_vec()));

        let events = sink.take();
        let last = events.last().unwrap();
        assert_eq!(
            last.payload,
            EventPayload::Opaque {
                protocol: ProtocolTag::Imap,
                data: b"* OK ready\r\n".to_vec()
            }
        );
        assert_eq!(last.context.kind(), ContextKind::Opaque(ProtocolTag::Imap));
        assert_eq!(last.context.describe_src(), "ipv4:192.168.1.1/tcp:220/imap");
    }
}
