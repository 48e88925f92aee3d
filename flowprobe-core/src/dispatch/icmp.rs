//! ICMP stage.

use std::sync::Arc;

use super::Pdu;
use crate::address::{FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

/// Type, code, checksum and the four rest-of-header bytes.
const ICMP_HEADER: usize = 8;

pub fn process(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < ICMP_HEADER {
        return Err(ProtocolError::too_short("ICMP", ICMP_HEADER, data.len()).into());
    }

    let addr = FlowAddress::sentinel(Purpose::Control, ProtocolTag::Icmp, pdu.direction);
    let context = ip.get_or_create(&addr, |_| ContextState::Icmp);
    context.set_ttl(engine.config().default_ttl);

    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::Icmp {
            kind: data[0],
            code: data[1],
            data: data[ICMP_HEADER..].to_vec(),
        },
    );
    Ok(())
}
