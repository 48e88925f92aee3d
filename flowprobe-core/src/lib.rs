//! # flowprobe-core
//!
//! Flow-context engine for a network probe. Captured IP packets are walked
//! through a tree of per-flow, per-layer contexts; fragmented datagrams and
//! out-of-order TCP segments are reassembled, application protocols are
//! identified by port or by content, and every completed protocol unit is
//! emitted as an [`Event`] to an [`EventSink`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowprobe_core::{Direction, Engine, EngineConfig, QueueSink};
//!
//! let (sink, events) = QueueSink::new(1000);
//! let engine = Engine::new(EngineConfig::default(), Arc::new(sink));
//! let _reaper = engine.spawn_reaper().unwrap();
//!
//! # let packet: Vec<u8> = Vec::new();
//! engine.handle("eth0", "default", Direction::NotKnown, 0, &packet).ok();
//! while let Ok(event) = events.try_recv() {
//!     println!("{} {}", event.context.describe(), event.payload.name());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          flowprobe-core                             |
//! +---------------------------------------------------------------------+
//! |  address/     - Address, FlowAddress, Direction                      |
//! |  context/     - ContextNode tree, Arena index, per-kind state        |
//! |  reaper/      - TTL schedule, Clock, background sweeper              |
//! |  reassembly/  - IPv4 fragments, TCP segments                         |
//! |  dispatch/    - IP, TCP, UDP, ICMP, GRE, ESP stages, port tables     |
//! |  decoders/    - HTTP, DNS, SMTP, FTP, SIP, RTP, TLS, NTP, ...        |
//! |  event/sink   - Event, EventPayload, EventSink implementations       |
//! |  forgery/     - TCP reset, TCP data and DNS response injection       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Supported Protocols
//!
//! | Layer | Protocols |
//! |-------|-----------|
//! | Network | IPv4 (with fragment reassembly), IPv6, GRE, ESP |
//! | Transport | TCP (with segment reassembly), UDP, ICMP |
//! | Application | HTTP, DNS, SMTP, FTP, SIP, RTP, TLS handshake, NTP |
//! | Opaque | IMAP, POP3, SMTP AUTH and their TLS ports |

pub mod address;
pub mod config;
pub mod context;
pub mod decoders;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod forgery;
pub mod reaper;
pub mod reassembly;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_utils;

pub use address::{Address, Direction, FlowAddress, ProtocolTag, Purpose};
pub use config::EngineConfig;
pub use context::{ContextId, ContextKind, ContextNode};
pub use dispatch::{Handler, PortTable};
pub use engine::Engine;
pub use error::{Error, ProtocolError, Result};
pub use event::{Event, EventPayload};
pub use forgery::PacketInjector;
pub use reaper::{Clock, ManualClock, ReaperHandle, SystemClock};
pub use sink::{EventSink, QueueSink, VecSink};
