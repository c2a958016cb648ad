//! # Node Store
//!
//! Resolves durable node identities `(intention_pos, slot)` to in-memory
//! nodes. The store is shared by every reader and the transaction
//! processor; it is the single place where serialized after-images become
//! live tree nodes.
//!
//! ## Resolution
//!
//! On a miss the store fetches the whole after-image for the requested
//! intention position through the entry service, decodes every node in it,
//! links intra-image child references as resident, and admits the batch.
//! Decoding the whole image is deliberate: siblings are overwhelmingly
//! likely to be visited by the same traversal that triggered the miss.
//!
//! ## Eviction
//!
//! The cache is bounded and evicts in insertion order. Eviction only drops
//! the resolution entry: any node still reachable from a live root stays
//! alive through its parent's `Resident` reference, so readers never lose a
//! node they can reach - they only pay a re-decode if they arrive at it via
//! a `Remote` edge later.

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::node::{Node, NodePtr, SharedNode};
use crate::encoding::{AfterImage, NodeRef};
use crate::service::EntryService;

struct StoreInner {
    map: HashMap<(u64, u32), SharedNode>,
    order: VecDeque<(u64, u32)>,
    cap: usize,
}

pub struct NodeStore {
    entries: Arc<EntryService>,
    inner: Mutex<StoreInner>,
}

impl NodeStore {
    pub fn new(entries: Arc<EntryService>, cap: usize) -> Self {
        Self {
            entries,
            inner: Mutex::new(StoreInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                cap,
            }),
        }
    }

    /// Resolves `(pos, slot)` to a node, demand-loading the after-image of
    /// the intention at `pos` if it is not cached.
    pub fn resolve(&self, pos: u64, slot: u32) -> Result<SharedNode> {
        {
            let inner = self.inner.lock();
            if let Some(node) = inner.map.get(&(pos, slot)) {
                return Ok(node.clone());
            }
        }

        let image = self.entries.after_image(pos)?;
        let nodes = Self::materialize(&image);
        ensure!(
            (slot as usize) < nodes.len(),
            "slot {slot} out of bounds for after image of intention {pos} ({} nodes)",
            nodes.len()
        );
        let wanted = nodes[slot as usize].clone();

        let mut inner = self.inner.lock();
        for node in nodes {
            Self::admit(&mut inner, (pos, node.slot()), node);
        }
        Ok(wanted)
    }

    /// Resolves a pointer to a node, or `None` for nil.
    pub fn resolve_ptr(&self, ptr: &NodePtr) -> Result<Option<SharedNode>> {
        match ptr {
            NodePtr::Nil => Ok(None),
            NodePtr::Resident(node) => Ok(Some(node.clone())),
            NodePtr::Remote { pos, slot } => Ok(Some(self.resolve(*pos, *slot)?)),
        }
    }

    /// Admits a freshly committed delta so readers resolve its nodes
    /// without a log round-trip. Every node must already be stamped.
    pub fn install(&self, nodes: &[SharedNode]) -> Result<()> {
        let mut inner = self.inner.lock();
        for node in nodes {
            let rid = node.rid();
            ensure!(rid >= 0, "cannot install node with private rid {rid}");
            Self::admit(&mut inner, (rid as u64, node.slot()), node.clone());
        }
        Ok(())
    }

    /// Builds resident nodes from a serialized after-image. Serialization
    /// orders parents before children, so building in reverse slot order
    /// lets intra-image references link resident immediately; anything not
    /// yet built stays a `Remote` edge and resolves through the cache.
    fn materialize(image: &AfterImage) -> Vec<SharedNode> {
        let ipos = image.intention_pos();
        let count = image.nodes().len();
        let mut slots: Vec<Option<SharedNode>> = vec![None; count];
        for idx in (0..count).rev() {
            let raw = &image.nodes()[idx];
            let left = Self::link(&raw.left, ipos, &slots);
            let right = Self::link(&raw.right, ipos, &slots);
            slots[idx] = Some(Node::restored(
                raw.key.clone(),
                raw.value.clone(),
                raw.height,
                ipos,
                idx as u32,
                left,
                right,
            ));
        }
        slots.into_iter().flatten().collect()
    }

    fn link(child: &NodeRef, ipos: u64, built: &[Option<SharedNode>]) -> NodePtr {
        match *child {
            NodeRef::Nil => NodePtr::Nil,
            NodeRef::Node { pos, slot } => {
                if pos == ipos {
                    if let Some(Some(node)) = built.get(slot as usize) {
                        return NodePtr::Resident(node.clone());
                    }
                }
                NodePtr::Remote { pos, slot }
            }
        }
    }

    fn admit(inner: &mut StoreInner, key: (u64, u32), node: SharedNode) {
        if inner.map.insert(key, node).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > inner.cap {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.map.remove(&old);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.inner.lock().map.len()
    }
}
