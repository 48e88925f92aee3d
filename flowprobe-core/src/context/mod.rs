//! The per-flow context tree.
//!
//! Every protocol layer of every observed flow is a [`ContextNode`]. A node
//! is owned by exactly one parent, through the parent's child map keyed by
//! [`FlowAddress`]; that map is the only strong edge in the tree. The
//! parent and reverse-flow relations are plain ids resolved through the
//! shared [`Arena`] index, so the tree has no reference cycles and a
//! detached node simply fails to resolve.
//!
//! ## Locking
//!
//! Each node has one mutex guarding its child map and its [`ContextState`].
//! Code never holds a node's lock while taking the same node's lock again:
//! a guard returned by [`ContextNode::state`] must be dropped before calling
//! [`ContextNode::get_or_create`] on that node.

mod arena;
mod state;

pub use arena::Arena;
pub use state::{ContextKind, ContextState, RootState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::trace;

use crate::address::{Address, FlowAddress};
use crate::error::{Error, Result};

/// Process-unique context identifier. Zero is never allocated.
pub type ContextId = u64;

const NO_CONTEXT: ContextId = 0;

struct NodeInner {
    children: BTreeMap<FlowAddress, Arc<ContextNode>>,
    state: ContextState,
}

/// One protocol layer of one flow.
pub struct ContextNode {
    id: ContextId,
    kind: ContextKind,
    addr: FlowAddress,
    parent: ContextId,
    reverse: AtomicU64,
    created: SystemTime,
    arena: Arc<Arena>,
    inner: Mutex<NodeInner>,
}

impl std::fmt::Debug for ContextNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("parent", &self.parent)
            .field("reverse", &self.reverse.load(Ordering::Acquire))
            .finish()
    }
}

impl ContextNode {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn addr(&self) -> &FlowAddress {
        &self.addr
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn parent(&self) -> Option<Arc<ContextNode>> {
        match self.parent {
            NO_CONTEXT => None,
            id => self.arena.get(id),
        }
    }

    /// The context for the opposite direction of this flow, if one was
    /// found when either side was created and it is still alive.
    pub fn reverse(&self) -> Option<Arc<ContextNode>> {
        match self.reverse.load(Ordering::Acquire) {
            NO_CONTEXT => None,
            id => self.arena.get(id),
        }
    }

    /// Lock this node and borrow its protocol state.
    pub fn state(&self) -> MappedMutexGuard<'_, ContextState> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.state)
    }

    pub fn get_child(&self, addr: &FlowAddress) -> Option<Arc<ContextNode>> {
        self.inner.lock().children.get(addr).cloned()
    }

    pub fn children(&self) -> Vec<Arc<ContextNode>> {
        self.inner.lock().children.values().cloned().collect()
    }

    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Create and register a child, failing if `addr` is already taken.
    pub fn add_child(
        self: &Arc<Self>,
        addr: FlowAddress,
        state: ContextState,
    ) -> Result<Arc<ContextNode>> {
        let rev = addr.reversed();
        let (child, sibling) = {
            let mut inner = self.inner.lock();
            if inner.children.contains_key(&addr) {
                return Err(Error::DuplicateContext { address: addr });
            }
            let child = self.arena.allocate(self.id, addr.clone(), state);
            inner.children.insert(addr, child.clone());
            let sibling = self.root_sibling(&inner, &rev);
            (child, sibling)
        };
        self.link_reverse(&child, sibling, &rev);
        Ok(child)
    }

    /// Return the child at `addr`, creating it with `create` if absent.
    ///
    /// Lookup and insertion happen under this node's lock, so concurrent
    /// callers agree on a single child. A newly created child is then linked
    /// to its reverse flow, if one exists:
    ///
    /// 1. if this node has a reverse, that node's child at the mirrored
    ///    address;
    /// 2. otherwise, if this node is a root, its own child at the mirrored
    ///    address.
    ///
    /// Linking is attempted once, at creation.
    pub fn get_or_create<F>(self: &Arc<Self>, addr: &FlowAddress, create: F) -> Arc<ContextNode>
    where
        F: FnOnce(&FlowAddress) -> ContextState,
    {
        let rev = addr.reversed();
        let (child, sibling) = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.children.get(addr) {
                return existing.clone();
            }
            let child = self.arena.allocate(self.id, addr.clone(), create(addr));
            inner.children.insert(addr.clone(), child.clone());
            let sibling = self.root_sibling(&inner, &rev);
            (child, sibling)
        };
        self.link_reverse(&child, sibling, &rev);
        child
    }

    fn root_sibling(&self, inner: &NodeInner, rev: &FlowAddress) -> Option<Arc<ContextNode>> {
        if self.kind == ContextKind::Root {
            inner.children.get(rev).cloned()
        } else {
            None
        }
    }

    fn link_reverse(
        &self,
        child: &Arc<ContextNode>,
        root_sibling: Option<Arc<ContextNode>>,
        rev: &FlowAddress,
    ) {
        let other = match self.reverse() {
            Some(parent_rev) => parent_rev.get_child(rev),
            None => root_sibling,
        };
        if let Some(other) = other {
            if other.id != child.id {
                child.reverse.store(other.id, Ordering::Release);
                other.reverse.store(child.id, Ordering::Release);
                trace!(context = child.id, reverse = other.id, "linked reverse flow");
            }
        }
    }

    /// Detach this node from its parent.
    ///
    /// A node whose parent is already gone is treated as detached. The node
    /// itself is destroyed once the last outstanding reference is dropped.
    pub fn reap(&self) {
        let Some(parent) = self.parent() else {
            trace!(context = self.id, "reap: parent already gone");
            return;
        };
        let removed = {
            let mut inner = parent.inner.lock();
            match inner.children.get(&self.addr) {
                Some(child) if child.id == self.id => inner.children.remove(&self.addr),
                _ => None,
            }
        };
        drop(removed);
    }

    /// Schedule (or re-arm) expiry of this node.
    pub fn set_ttl(&self, secs: u64) {
        self.arena.reaper().set_ttl(self.id, secs);
    }

    pub fn unset_ttl(&self) {
        self.arena.reaper().unset_ttl(self.id);
    }

    /// Nearest node of the given kind, starting with this one.
    pub fn ancestor(self: &Arc<Self>, kind: ContextKind) -> Option<Arc<ContextNode>> {
        self.ancestor_where(|k| k == kind)
    }

    pub fn ancestor_where<P>(self: &Arc<Self>, pred: P) -> Option<Arc<ContextNode>>
    where
        P: Fn(ContextKind) -> bool,
    {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if pred(node.kind) {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    /// The root of this node's tree.
    pub fn root(self: &Arc<Self>) -> Option<Arc<ContextNode>> {
        self.ancestor(ContextKind::Root)
    }

    /// Device and network of the root this node belongs to.
    pub fn device_network(self: &Arc<Self>) -> Option<(String, String)> {
        let root = self.root()?;
        let state = root.state();
        match &*state {
            ContextState::Root(r) => Some((r.device.clone(), r.network.clone())),
            _ => None,
        }
    }

    /// Source and destination of the innermost IP layer above this node.
    pub fn network_info(self: &Arc<Self>) -> Option<(Address, Address)> {
        let ip = self.ancestor_where(|k| matches!(k, ContextKind::Ip4 | ContextKind::Ip6))?;
        Some((ip.addr.src.clone(), ip.addr.dest.clone()))
    }

    /// Ancestry of this context as seen from the sending side.
    pub fn describe(self: &Arc<Self>) -> String {
        self.describe_src()
    }

    /// Ancestry of the source side, e.g. `ipv4:10.0.0.1/tcp:1234/http`.
    pub fn describe_src(self: &Arc<Self>) -> String {
        self.describe_with(|addr| &addr.src)
    }

    /// Ancestry of the destination side, e.g. `ipv4:10.0.0.2/tcp:80/http`.
    pub fn describe_dest(self: &Arc<Self>) -> String {
        self.describe_with(|addr| &addr.dest)
    }

    fn describe_with<F>(self: &Arc<Self>, side: F) -> String
    where
        F: Fn(&FlowAddress) -> &Address,
    {
        let mut parts = Vec::new();
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.kind != ContextKind::Root {
                let addr = side(&node.addr);
                if addr.bytes.is_empty() {
                    parts.push(node.kind.name().to_string());
                } else {
                    parts.push(format!("{}:{}", node.kind.name(), addr));
                }
            }
            current = node.parent();
        }
        parts.reverse();
        parts.join("/")
    }
}

impl Drop for ContextNode {
    fn drop(&mut self) {
        self.arena.forget(self.id);
        self.arena.reaper().self_reaped(self.id);
    }
}
