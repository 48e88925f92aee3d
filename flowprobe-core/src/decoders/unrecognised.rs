//! Fallback decoders for traffic no other decoder claimed.

use std::sync::Arc;

use crate::address::{FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::Result;
use crate::event::EventPayload;

/// Stream bytes, tagged with their offset in the stream.
pub fn process_stream(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let addr = FlowAddress::sentinel(Purpose::Transport, ProtocolTag::Unrecognised, pdu.direction);
    let context = transport.get_or_create(&addr, |_| ContextState::UnrecognisedStream { position: 0 });

    let position = match &mut *context.state() {
        ContextState::UnrecognisedStream { position } => {
            let start = *position;
            *position += pdu.len() as u64;
            start
        }
        _ => 0,
    };

    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::UnrecognisedStream {
            data: pdu.data.to_vec(),
            position,
        },
    );
    Ok(())
}

pub fn process_datagram(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let addr = FlowAddress::sentinel(Purpose::Transport, ProtocolTag::Unrecognised, pdu.direction);
    let context = transport.get_or_create(&addr, |_| ContextState::UnrecognisedDatagram);
    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::UnrecognisedDatagram {
            data: pdu.data.to_vec(),
        },
    );
    Ok(())
}
