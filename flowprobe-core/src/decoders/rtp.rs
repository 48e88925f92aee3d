//! RTP media, bound dynamically from SIP session descriptions.
//!
//! Media payload is passed through whole; only the fixed header length is
//! checked.

use std::sync::Arc;

use super::app_context;
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::Pdu;
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const RTP_HEADER: usize = 12;

pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    if pdu.len() < RTP_HEADER {
        return Err(ProtocolError::too_short("RTP", RTP_HEADER, pdu.len()).into());
    }
    let context = app_context(transport, ProtocolTag::Rtp, pdu.direction, || ContextState::Rtp);
    engine.emit(
        &context,
        pdu.timestamp_us,
        EventPayload::Rtp {
            data: pdu.data.to_vec(),
        },
    );
    Ok(())
}
