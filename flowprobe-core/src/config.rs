//! Engine configuration.

use std::time::Duration;

/// Tunables for the flow-context engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle lifetime of a context, refreshed on every packet (seconds).
    pub default_ttl: u64,
    /// Grace period after TCP FIN or RST (seconds).
    pub close_ttl: u64,
    /// Outstanding IP fragments per IP context before the oldest is evicted.
    pub max_fragments: usize,
    /// Out-of-order TCP segments per direction before a forced sequence jump.
    pub max_segments: usize,
    /// Bytes collected before content sniffing an unidentified TCP stream.
    pub ident_threshold: usize,
    /// Nested tunnel layers (IP in GRE in IP...) decoded before a packet is rejected.
    pub max_encapsulation_depth: usize,
    /// Reaper wake-up interval.
    pub reaper_tick: Duration,
    /// Capacity of the bounded event queue used by `QueueSink`.
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: 120,
            close_ttl: 2,
            max_fragments: 50,
            max_segments: 100,
            ident_threshold: 20,
            max_encapsulation_depth: 8,
            reaper_tick: Duration::from_secs(1),
            event_queue_capacity: 1000,
        }
    }
}

impl EngineConfig {
    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = secs;
        self
    }

    pub fn with_max_fragments(mut self, max: usize) -> Self {
        self.max_fragments = max;
        self
    }

    pub fn with_max_segments(mut self, max: usize) -> Self {
        self.max_segments = max;
        self
    }

    pub fn with_max_encapsulation_depth(mut self, depth: usize) -> Self {
        self.max_encapsulation_depth = depth;
        self
    }

    pub fn with_reaper_tick(mut self, tick: Duration) -> Self {
        self.reaper_tick = tick;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }
}
