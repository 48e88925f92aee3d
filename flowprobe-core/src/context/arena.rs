//! Id allocation and the id → node index.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{ContextId, ContextNode, ContextState, NodeInner, RootState, NO_CONTEXT};
use crate::address::{Address, Direction, FlowAddress, ProtocolTag, Purpose};
use crate::reaper::{Clock, Reaper};

/// Shared index of live contexts, plus their expiry schedule.
///
/// The index holds only weak references; ownership stays with the tree.
pub struct Arena {
    next_id: AtomicU64,
    nodes: Mutex<HashMap<ContextId, Weak<ContextNode>>>,
    reaper: Reaper,
}

impl Arena {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(NO_CONTEXT + 1),
            nodes: Mutex::new(HashMap::new()),
            reaper: Reaper::new(clock),
        })
    }

    /// Resolve an id to a live node.
    pub fn get(&self, id: ContextId) -> Option<Arc<ContextNode>> {
        // Upgrade outside the lock: a failed upgrade races with Drop, which
        // takes this lock.
        let weak = self.nodes.lock().get(&id).cloned()?;
        weak.upgrade()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Run one reaper pass, detaching every expired context.
    pub fn sweep(&self) -> usize {
        self.reaper.run_once(|id| {
            if let Some(node) = self.get(id) {
                node.reap();
            }
        })
    }

    /// Create a root context. Roots have no parent and are never scheduled
    /// for expiry; their owner decides when they go away.
    pub fn create_root(
        self: &Arc<Self>,
        device: &str,
        network: &str,
        trigger_address: Option<Address>,
    ) -> Arc<ContextNode> {
        let state = ContextState::Root(RootState {
            device: device.to_string(),
            network: network.to_string(),
            trigger_address,
        });
        let addr = FlowAddress::sentinel(Purpose::Root, ProtocolTag::NoProtocol, Direction::NotKnown);
        self.allocate(NO_CONTEXT, addr, state)
    }

    pub(super) fn allocate(
        self: &Arc<Self>,
        parent: ContextId,
        addr: FlowAddress,
        state: ContextState,
    ) -> Arc<ContextNode> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(ContextNode {
            id,
            kind: state.kind(),
            addr,
            parent,
            reverse: AtomicU64::new(NO_CONTEXT),
            created: SystemTime::now(),
            arena: self.clone(),
            inner: Mutex::new(NodeInner {
                children: BTreeMap::new(),
                state,
            }),
        });
        self.nodes.lock().insert(id, Arc::downgrade(&node));
        node
    }

    pub(super) fn forget(&self, id: ContextId) {
        self.nodes.lock().remove(&id);
    }
}
