//! ESP stage. The payload is encrypted, so only the SPI, sequence number
//! and length are reported.

use std::sync::Arc;

use super::{read_u32, Pdu};
use crate::address::{FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

/// SPI and sequence number.
const ESP_HEADER: usize = 8;

pub fn process(engine: &Engine, ip: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let data = pdu.data;
    if data.len() < ESP_HEADER {
        return Err(ProtocolError::too_short("ESP", ESP_HEADER, data.len()).into());
    }

    let addr = FlowAddress::sentinel(Purpose::Transport, ProtocolTag::Esp, pdu.direction);
    let context = ip.get_or_create(&addr, |_| ContextState::Esp);
    context.set_ttl(engine.config().default_ttl);

    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::Esp {
            spi: read_u32(data, 0),
            sequence: read_u32(data, 4),
            length: data.len() - ESP_HEADER,
        },
    );
    Ok(())
}
