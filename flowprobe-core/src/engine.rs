//! The engine: root registry, port tables, event sink and reaper wiring.
//!
//! [`Engine::handle`] is the single entry point from capture. It resolves
//! the root context for `(device, network)` and walks the packet down the
//! dispatch pipeline. Errors are returned for the caller to log; they never
//! leave shared state inconsistent.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::address::{Address, Direction, ProtocolTag};
use crate::config::EngineConfig;
use crate::context::{Arena, ContextNode, ContextState};
use crate::dispatch::{ip, Handler, PortTable, Pdu};
use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::reaper::{Clock, ReaperHandle, SystemClock};
use crate::sink::EventSink;

type RootKey = (String, String);

/// A flow-context engine instance.
///
/// Independent instances share nothing: each owns its context arena, root
/// registry and port tables.
pub struct Engine {
    config: EngineConfig,
    arena: Arc<Arena>,
    roots: Mutex<HashMap<RootKey, Arc<ContextNode>>>,
    tcp_ports: PortTable,
    udp_ports: PortTable,
    sink: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    /// Create an engine whose expiry schedule runs on `clock`.
    pub fn with_clock(
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            arena: Arena::new(clock),
            roots: Mutex::new(HashMap::new()),
            tcp_ports: PortTable::tcp_defaults(),
            udp_ports: PortTable::udp_defaults(),
            sink,
        }
    }

    /// Process one captured IP packet.
    pub fn handle(
        &self,
        device: &str,
        network: &str,
        direction: Direction,
        timestamp_us: i64,
        data: &[u8],
    ) -> Result<()> {
        let root = self.get_root_context(device, network);
        ip::process(self, &root, Pdu::new(data, timestamp_us, direction))
    }

    /// The root context for `(device, network)`, created on first use.
    pub fn get_root_context(&self, device: &str, network: &str) -> Arc<ContextNode> {
        let mut roots = self.roots.lock();
        let key = (device.to_string(), network.to_string());
        roots
            .entry(key)
            .or_insert_with(|| {
                info!(device, network, "root context created");
                self.arena.create_root(device, network, None)
            })
            .clone()
    }

    /// Record the target address that triggered capture for a root.
    pub fn set_target(&self, device: &str, network: &str, target: Address) {
        let root = self.get_root_context(device, network);
        let mut state = root.state();
        if let ContextState::Root(root_state) = &mut *state {
            root_state.trigger_address = Some(target);
        }
    }

    /// Drop a root and, once in-flight references are released, its whole
    /// tree. Returns whether the root existed.
    pub fn close_root_context(&self, device: &str, network: &str) -> bool {
        let removed = self
            .roots
            .lock()
            .remove(&(device.to_string(), network.to_string()));
        match removed {
            Some(root) => {
                info!(device, network, contexts = root.child_count(), "root context closed");
                drop(root);
                true
            }
            None => false,
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Live contexts across all roots, roots included.
    pub fn context_count(&self) -> usize {
        self.arena.len()
    }

    /// Run one reaper pass on the calling thread.
    pub fn sweep(&self) -> usize {
        self.arena.sweep()
    }

    /// Start the background reaper, ticking at `config.reaper_tick`.
    pub fn spawn_reaper(&self) -> io::Result<ReaperHandle> {
        let arena = self.arena.clone();
        debug!(tick = ?self.config.reaper_tick, "starting reaper");
        ReaperHandle::spawn(self.config.reaper_tick, move || {
            arena.sweep();
        })
    }

    /// Deliver an event to the sink.
    pub fn emit(&self, context: &Arc<ContextNode>, timestamp_us: i64, payload: EventPayload) {
        self.sink
            .handle(Event::new(context.clone(), timestamp_us, payload));
    }

    /// Deliver events collected while a context was locked, in order.
    pub fn emit_all(&self, context: &Arc<ContextNode>, timestamp_us: i64, payloads: Vec<EventPayload>) {
        for payload in payloads {
            self.emit(context, timestamp_us, payload);
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn tcp_ports(&self) -> &PortTable {
        &self.tcp_ports
    }

    pub fn udp_ports(&self) -> &PortTable {
        &self.udp_ports
    }

    fn ports(&self, protocol: ProtocolTag) -> Option<&PortTable> {
        match protocol {
            ProtocolTag::Tcp => Some(&self.tcp_ports),
            ProtocolTag::Udp => Some(&self.udp_ports),
            _ => None,
        }
    }

    /// Bind `handler` to a TCP or UDP port. An existing binding is kept and
    /// `false` returned.
    pub fn add_port_handler(&self, protocol: ProtocolTag, port: u16, handler: Handler) -> bool {
        self.ports(protocol)
            .is_some_and(|table| table.add(port, handler))
    }

    pub fn remove_port_handler(&self, protocol: ProtocolTag, port: u16) -> Option<Handler> {
        self.ports(protocol)?.remove(port)
    }

    pub fn has_port_handler(&self, protocol: ProtocolTag, port: u16) -> bool {
        self.ports(protocol)
            .is_some_and(|table| table.contains(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Purpose;
    use crate::dispatch::ports::handlers;
    use crate::reaper::ManualClock;
    use crate::sink::VecSink;
    use crate::test_utils::{IcmpBuilder, Ipv4Builder};

    fn engine() -> (Arc<ManualClock>, Arc<VecSink>, Engine) {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(VecSink::new());
        let engine = Engine::with_clock(EngineConfig::default(), sink.clone(), clock.clone());
        (clock, sink, engine)
    }

    #[test]
    fn test_root_registry() {
        let (_clock, _sink, engine) = engine();
        let a = engine.get_root_context("eth0", "net1");
        let b = engine.get_root_context("eth0", "net1");
        let c = engine.get_root_context("eth0", "net2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(engine.root_count(), 2);

        drop((a, b, c));
        assert!(engine.close_root_context("eth0", "net1"));
        assert!(!engine.close_root_context("eth0", "net1"));
        assert_eq!(engine.root_count(), 1);
        assert_eq!(engine.context_count(), 1);
    }

    #[test]
    fn test_set_target() {
        let (_clock, _sink, engine) = engine();
        let target = Address::new(Purpose::Network, ProtocolTag::Ip4, &[10, 0, 0, 1]);
        engine.set_target("eth0", "net", target.clone());
        let root = engine.get_root_context("eth0", "net");
        let state = root.state();
        match &*state {
            ContextState::Root(r) => assert_eq!(r.trigger_address.as_ref(), Some(&target)),
            other => panic!("unexpected state {:?}", other.kind()),
        };
    }

    #[test]
    fn test_idle_flow_expires_and_active_flow_survives() {
        let (clock, _sink, engine) = engine();
        let ping = |src: [u8; 4]| {
            Ipv4Builder::new()
                .icmp()
                .src_ip(src)
                .payload(IcmpBuilder::new().build())
                .build()
        };

        engine.handle("eth0", "net", Direction::NotKnown, 0, &ping([10, 0, 0, 1])).unwrap();
        engine.handle("eth0", "net", Direction::NotKnown, 0, &ping([10, 0, 0, 2])).unwrap();
        let root = engine.get_root_context("eth0", "net");
        assert_eq!(root.child_count(), 2);

        // Refresh the first flow every 60 seconds; leave the second idle.
        for _ in 0..4 {
            clock.advance(60);
            engine.handle("eth0", "net", Direction::NotKnown, 0, &ping([10, 0, 0, 1])).unwrap();
            engine.sweep();
        }
        assert_eq!(root.child_count(), 1);
        let survivor = &root.children()[0];
        assert_eq!(survivor.addr().src.to_string(), "10.0.0.1");
    }

    #[test]
    fn test_close_root_releases_tree() {
        let (_clock, sink, engine) = engine();
        let ping = Ipv4Builder::new()
            .icmp()
            .payload(IcmpBuilder::new().build())
            .build();
        engine.handle("eth0", "net", Direction::NotKnown, 0, &ping).unwrap();
        assert_eq!(engine.context_count(), 3);

        // Events hold their contexts alive.
        drop(sink.take());
        assert!(engine.close_root_context("eth0", "net"));
        assert_eq!(engine.context_count(), 0);
        // Schedule entries of the destroyed contexts are dropped on the next pass.
        engine.sweep();
        assert_eq!(engine.arena().reaper().scheduled(), 0);
    }

    #[test]
    fn test_port_handlers_per_engine() {
        let (_clock, _sink, first) = engine();
        let (_clock2, _sink2, other) = engine();

        assert!(first.has_port_handler(ProtocolTag::Tcp, 25));
        assert!(!first.add_port_handler(ProtocolTag::Tcp, 25, handlers::HTTP_REQUEST));
        assert!(first.add_port_handler(ProtocolTag::Udp, 40000, handlers::RTP));
        assert!(first.has_port_handler(ProtocolTag::Udp, 40000));
        assert!(!other.has_port_handler(ProtocolTag::Udp, 40000));

        assert_eq!(first.remove_port_handler(ProtocolTag::Udp, 40000), Some(handlers::RTP));
        assert!(!first.has_port_handler(ProtocolTag::Udp, 40000));
        assert!(!first.add_port_handler(ProtocolTag::Icmp, 1, handlers::RTP));
    }
}
