//! Application-layer decoders.
//!
//! Every decoder has the [`DecodeFn`](crate::dispatch::DecodeFn) shape: it
//! receives the engine, the transport context it is bound to and an
//! in-order byte slice. It resolves its own context under the transport
//! context, updates that context's state under its lock, and emits events
//! once the lock is released.
//!
//! A decoder that returns a parse error on a TCP stream is replaced by the
//! unrecognised-stream decoder for the rest of that stream.

pub mod dns;
pub mod ftp;
pub mod http;
pub mod lines;
pub mod ntp;
pub mod opaque;
pub mod rtp;
pub mod sip;
pub mod smtp;
pub mod tls;
pub mod unrecognised;

use std::sync::Arc;

use crate::address::{Direction, FlowAddress, ProtocolTag, Purpose};
use crate::context::{ContextNode, ContextState};

/// The per-direction application context for `protocol` under `transport`.
pub(crate) fn app_context<F>(
    transport: &Arc<ContextNode>,
    protocol: ProtocolTag,
    direction: Direction,
    create: F,
) -> Arc<ContextNode>
where
    F: FnOnce() -> ContextState,
{
    let addr = FlowAddress::sentinel(Purpose::Application, protocol, direction);
    transport.get_or_create(&addr, |_| create())
}

/// Source port of a TCP or UDP context.
pub(crate) fn src_port(transport: &ContextNode) -> Option<u16> {
    transport.addr().src.as_u16()
}

pub(crate) fn dest_port(transport: &ContextNode) -> Option<u16> {
    transport.addr().dest.as_u16()
}
