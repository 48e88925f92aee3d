//! UDP stage.

use std::sync::Arc;

use etherparse::UdpHeaderSlice;
use tracing::trace;

use super::ports::handlers;
use super::Pdu;
use crate::address::{Address, FlowAddress, ProtocolTag};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};

const UDP_HEADER: usize = 8;

pub fn process(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < UDP_HEADER {
        return Err(ProtocolError::too_short("UDP", UDP_HEADER, data.len()).into());
    }
    let header = UdpHeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
        protocol: "UDP",
        field: "header",
        reason: format!("{e}"),
    })?;

    let length = header.length() as usize;
    if length > data.len() {
        return Err(ProtocolError::Truncated {
            protocol: "UDP",
            declared: length,
            captured: data.len(),
        }
        .into());
    }
    if length != data.len() {
        return Err(ProtocolError::InvalidField {
            protocol: "UDP",
            field: "length",
            reason: format!("header says {length} bytes, datagram has {}", data.len()),
        }
        .into());
    }

    let src = header.source_port();
    let dest = header.destination_port();
    let addr = FlowAddress::new(
        Address::port(ProtocolTag::Udp, src),
        Address::port(ProtocolTag::Udp, dest),
        pdu.direction,
    );
    let context = ip.get_or_create(&addr, |_| ContextState::Udp);
    context.set_ttl(engine.config().default_ttl);

    let handler = engine
        .udp_ports()
        .lookup(src, dest)
        .unwrap_or(handlers::UNRECOGNISED_DATAGRAM);
    trace!(context = context.id(), src, dest, handler = handler.name, "udp datagram");
    handler.call(engine, &context, pdu.skip(UDP_HEADER))
}
