//! # Tree Nodes and Node Pointers
//!
//! A node carries a key, a value, its AVL height, and two child pointers.
//! Nodes are immutable once published: every mutation of the tree creates
//! new nodes along the affected path. The only fields that change after
//! construction are the identity stamps (`rid`, `slot`), which move exactly
//! once from their private placeholders to the committing intention's log
//! position, before the node becomes reachable from any published root.
//!
//! ## Identity
//!
//! A node's durable identity is `(rid, slot)`:
//!
//! - `rid < 0`: the node is private to an in-flight transaction; the value
//!   is the transaction's resolution identity.
//! - `rid >= 0`: the node belongs to the after-image of the intention
//!   committed at log position `rid`, at index `slot` within that image.
//!
//! ## Pointers
//!
//! [`NodePtr`] is the tagged sum replacing pointer-hierarchy dispatch:
//! `Nil` is the logical null leaf, `Resident` holds an in-memory node, and
//! `Remote` names a node persisted inside an after-image that has not been
//! loaded here. Traversals resolve `Remote` through the node store.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

pub type SharedNode = Arc<Node>;

/// Slot value of a node that has not been sealed into a delta yet.
pub const UNASSIGNED_SLOT: u32 = u32::MAX;

#[derive(Clone)]
pub enum NodePtr {
    Nil,
    Resident(SharedNode),
    Remote { pos: u64, slot: u32 },
}

impl NodePtr {
    pub fn is_nil(&self) -> bool {
        matches!(self, NodePtr::Nil)
    }
}

impl fmt::Debug for NodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePtr::Nil => write!(f, "Nil"),
            NodePtr::Resident(node) => {
                write!(f, "Resident({}, {})", node.rid(), node.slot())
            }
            NodePtr::Remote { pos, slot } => write!(f, "Remote({pos}, {slot})"),
        }
    }
}

pub struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    height: u8,
    rid: AtomicI64,
    slot: AtomicU32,
    left: NodePtr,
    right: NodePtr,
}

impl Node {
    /// A node created by an in-flight transaction; `rid` is the owning
    /// tree's private (negative) resolution identity.
    pub fn fresh(
        key: Vec<u8>,
        value: Vec<u8>,
        height: u8,
        rid: i64,
        left: NodePtr,
        right: NodePtr,
    ) -> SharedNode {
        debug_assert!(rid < 0);
        Arc::new(Self {
            key,
            value,
            height,
            rid: AtomicI64::new(rid),
            slot: AtomicU32::new(UNASSIGNED_SLOT),
            left,
            right,
        })
    }

    /// A node decoded from the after-image of the intention at `pos`.
    pub fn restored(
        key: Vec<u8>,
        value: Vec<u8>,
        height: u8,
        pos: u64,
        slot: u32,
        left: NodePtr,
        right: NodePtr,
    ) -> SharedNode {
        Arc::new(Self {
            key,
            value,
            height,
            rid: AtomicI64::new(pos as i64),
            slot: AtomicU32::new(slot),
            left,
            right,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn left(&self) -> NodePtr {
        self.left.clone()
    }

    pub fn right(&self) -> NodePtr {
        self.right.clone()
    }

    pub fn rid(&self) -> i64 {
        self.rid.load(Ordering::SeqCst)
    }

    pub fn slot(&self) -> u32 {
        self.slot.load(Ordering::SeqCst)
    }

    pub fn set_rid(&self, rid: i64) {
        self.rid.store(rid, Ordering::SeqCst);
    }

    pub fn set_slot(&self, slot: u32) {
        self.slot.store(slot, Ordering::SeqCst);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("height", &self.height)
            .field("rid", &self.rid())
            .field("slot", &self.slot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_nodes_carry_private_identity() {
        let node = Node::fresh(b"k".to_vec(), b"v".to_vec(), 1, -3, NodePtr::Nil, NodePtr::Nil);
        assert_eq!(node.rid(), -3);
        assert_eq!(node.slot(), UNASSIGNED_SLOT);
    }

    #[test]
    fn stamping_moves_identity_to_intention() {
        let node = Node::fresh(b"k".to_vec(), b"v".to_vec(), 1, -1, NodePtr::Nil, NodePtr::Nil);
        node.set_slot(4);
        node.set_rid(17);
        assert_eq!(node.rid(), 17);
        assert_eq!(node.slot(), 4);
    }

    #[test]
    fn restored_nodes_carry_image_identity() {
        let node = Node::restored(
            b"k".to_vec(),
            b"v".to_vec(),
            2,
            9,
            1,
            NodePtr::Remote { pos: 3, slot: 0 },
            NodePtr::Nil,
        );
        assert_eq!(node.rid(), 9);
        assert_eq!(node.slot(), 1);
        assert!(matches!(node.left(), NodePtr::Remote { pos: 3, slot: 0 }));
        assert!(node.right().is_nil());
    }
}
