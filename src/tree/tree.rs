//! # Copy-on-Write Persistent Search Tree
//!
//! An AVL tree whose every mutation produces a new version: the search path
//! (plus any rebalancing) is copied into fresh nodes, everything else is
//! shared structurally with the previous version. A reader holding a root
//! pointer observes a frozen snapshot no later mutation can disturb.
//!
//! ## Versions and Deltas
//!
//! Each tree carries a resolution identity (`rid`). While a transaction is
//! in flight its rid is negative and every node the tree creates is stamped
//! with it, marking the node transaction-private. The *delta* of the tree
//! is the set of private nodes reachable from the current root - copies
//! orphaned by later operations in the same transaction fall out naturally
//! when the delta is collected.
//!
//! Commit processing runs in three steps:
//!
//! 1. `seal()` walks the root and collects the delta, assigning each node
//!    its slot index within the eventual after-image;
//! 2. `set_intention(pos)` restamps every delta node's rid to the
//!    intention's log position, giving it the durable identity
//!    `(pos, slot)`;
//! 3. `to_after_image()` serializes the delta; child references to older
//!    versions point at the images that own them.
//!
//! ## Remote Edges
//!
//! Traversals resolve `Remote` child pointers through the shared node
//! store, which demand-loads after-images from the log. A tree is therefore
//! only ever partially materialized: the resident fringe grows as reads
//! touch it and shrinks as the store evicts.
//!
//! ## Balancing
//!
//! Heights are stored per node and rebuilt bottom-up during path copy.
//! Rebalancing rebuilds at most two extra nodes per level (single or double
//! rotation); tolerances are the usual AVL ±1.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use eyre::{ensure, eyre, Result};

use super::node::{Node, NodePtr, SharedNode};
use super::store::NodeStore;
use crate::encoding::{AfterImage, ImageNode, NodeRef};

pub struct PersistentTree {
    store: Arc<NodeStore>,
    root: NodePtr,
    rid: i64,
    created: usize,
    mutated: bool,
    delta: Option<Vec<SharedNode>>,
    intention_pos: Option<u64>,
    after_image_pos: Option<u64>,
}

impl PersistentTree {
    /// A tree rooted at `root` with the private resolution identity `rid`.
    pub fn at(store: Arc<NodeStore>, root: NodePtr, rid: i64) -> Self {
        debug_assert!(rid < 0);
        Self {
            store,
            root,
            rid,
            created: 0,
            mutated: false,
            delta: None,
            intention_pos: None,
            after_image_pos: None,
        }
    }

    pub fn root(&self) -> NodePtr {
        self.root.clone()
    }

    pub fn rid(&self) -> i64 {
        self.rid
    }

    /// True when no operation changed the tree; such a transaction commits
    /// without touching the log.
    pub fn is_read_only(&self) -> bool {
        !self.mutated
    }

    pub fn intention_pos(&self) -> Option<u64> {
        self.intention_pos
    }

    pub fn after_image_pos(&self) -> Option<u64> {
        self.after_image_pos
    }

    pub fn set_after_image(&mut self, pos: u64) {
        self.after_image_pos = Some(pos);
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.root.clone();
        loop {
            let Some(node) = self.load(&cursor)? else {
                return Ok(None);
            };
            match key.cmp(node.key()) {
                CmpOrdering::Equal => return Ok(Some(node.value().to_vec())),
                CmpOrdering::Less => cursor = node.left(),
                CmpOrdering::Greater => cursor = node.right(),
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.root.clone();
        self.root = self.put_rec(&root, key, value)?;
        self.mutated = true;
        Ok(())
    }

    /// Removes `key`. Absent keys leave the tree untouched; the caller's
    /// intention still records the delete for conflict detection.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let root = self.root.clone();
        if let Some(new_root) = self.delete_rec(&root, key)? {
            self.root = new_root;
            self.mutated = true;
        }
        Ok(())
    }

    /// Collects the delta: private nodes reachable from the root, each
    /// assigned its slot within the eventual after-image. Idempotent.
    pub fn seal(&mut self) {
        if self.delta.is_some() {
            return;
        }
        let mut delta = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(ptr) = stack.pop() {
            if let NodePtr::Resident(node) = ptr {
                if node.rid() == self.rid {
                    node.set_slot(delta.len() as u32);
                    stack.push(node.left());
                    stack.push(node.right());
                    delta.push(node);
                }
            }
        }
        self.delta = Some(delta);
    }

    /// Restamps the sealed delta with the committing intention's log
    /// position, making every node addressable as `(pos, slot)`.
    pub fn set_intention(&mut self, pos: u64) {
        if let Some(delta) = &self.delta {
            for node in delta {
                node.set_rid(pos as i64);
            }
        }
        self.intention_pos = Some(pos);
        self.rid = pos as i64;
    }

    /// The sealed delta; empty until [`seal`](Self::seal) runs.
    pub fn delta(&self) -> &[SharedNode] {
        self.delta.as_deref().unwrap_or(&[])
    }

    /// Serializes the sealed, stamped delta as an after-image.
    pub fn to_after_image(&self) -> Result<AfterImage> {
        let pos = self
            .intention_pos
            .ok_or_else(|| eyre!("tree has no intention position"))?;
        let delta = self
            .delta
            .as_ref()
            .ok_or_else(|| eyre!("tree is not sealed"))?;
        let mut nodes = Vec::with_capacity(delta.len());
        for node in delta {
            nodes.push(ImageNode {
                key: node.key().to_vec(),
                value: node.value().to_vec(),
                height: node.height(),
                left: Self::child_ref(&node.left())?,
                right: Self::child_ref(&node.right())?,
            });
        }
        Ok(AfterImage::new(pos, nodes))
    }

    /// The root as a durable reference, valid once the delta is stamped.
    /// Published roots are always `Nil` or `Remote`, so readers resolve
    /// them through the store and the store stays in charge of residency.
    pub fn sealed_root_ref(&self) -> Result<NodePtr> {
        match &self.root {
            NodePtr::Nil => Ok(NodePtr::Nil),
            NodePtr::Remote { pos, slot } => Ok(NodePtr::Remote {
                pos: *pos,
                slot: *slot,
            }),
            NodePtr::Resident(node) => {
                let rid = node.rid();
                ensure!(rid >= 0, "root still carries private rid {rid}");
                Ok(NodePtr::Remote {
                    pos: rid as u64,
                    slot: node.slot(),
                })
            }
        }
    }

    fn child_ref(ptr: &NodePtr) -> Result<NodeRef> {
        match ptr {
            NodePtr::Nil => Ok(NodeRef::Nil),
            NodePtr::Remote { pos, slot } => Ok(NodeRef::Node {
                pos: *pos,
                slot: *slot,
            }),
            NodePtr::Resident(node) => {
                let rid = node.rid();
                ensure!(rid >= 0, "unstamped resident child with rid {rid}");
                Ok(NodeRef::Node {
                    pos: rid as u64,
                    slot: node.slot(),
                })
            }
        }
    }

    fn load(&self, ptr: &NodePtr) -> Result<Option<SharedNode>> {
        self.store.resolve_ptr(ptr)
    }

    fn height_of(&self, ptr: &NodePtr) -> Result<u8> {
        Ok(match self.load(ptr)? {
            Some(node) => node.height(),
            None => 0,
        })
    }

    fn mk_node(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        left: NodePtr,
        right: NodePtr,
    ) -> Result<NodePtr> {
        let height = 1 + self.height_of(&left)?.max(self.height_of(&right)?);
        self.created += 1;
        Ok(NodePtr::Resident(Node::fresh(
            key, value, height, self.rid, left, right,
        )))
    }

    fn put_rec(&mut self, ptr: &NodePtr, key: &[u8], value: &[u8]) -> Result<NodePtr> {
        let Some(node) = self.load(ptr)? else {
            return self.mk_node(key.to_vec(), value.to_vec(), NodePtr::Nil, NodePtr::Nil);
        };
        match key.cmp(node.key()) {
            CmpOrdering::Equal => {
                self.mk_node(key.to_vec(), value.to_vec(), node.left(), node.right())
            }
            CmpOrdering::Less => {
                let new_left = self.put_rec(&node.left(), key, value)?;
                self.balance(
                    node.key().to_vec(),
                    node.value().to_vec(),
                    new_left,
                    node.right(),
                )
            }
            CmpOrdering::Greater => {
                let new_right = self.put_rec(&node.right(), key, value)?;
                self.balance(
                    node.key().to_vec(),
                    node.value().to_vec(),
                    node.left(),
                    new_right,
                )
            }
        }
    }

    /// Returns the replacement subtree, or `None` when the key is absent
    /// and the subtree is unchanged.
    fn delete_rec(&mut self, ptr: &NodePtr, key: &[u8]) -> Result<Option<NodePtr>> {
        let Some(node) = self.load(ptr)? else {
            return Ok(None);
        };
        match key.cmp(node.key()) {
            CmpOrdering::Less => match self.delete_rec(&node.left(), key)? {
                None => Ok(None),
                Some(new_left) => Ok(Some(self.balance(
                    node.key().to_vec(),
                    node.value().to_vec(),
                    new_left,
                    node.right(),
                )?)),
            },
            CmpOrdering::Greater => match self.delete_rec(&node.right(), key)? {
                None => Ok(None),
                Some(new_right) => Ok(Some(self.balance(
                    node.key().to_vec(),
                    node.value().to_vec(),
                    node.left(),
                    new_right,
                )?)),
            },
            CmpOrdering::Equal => {
                let left = node.left();
                let right = node.right();
                if self.load(&left)?.is_none() {
                    return Ok(Some(right));
                }
                if self.load(&right)?.is_none() {
                    return Ok(Some(left));
                }
                let (succ_key, succ_value, new_right) = self.take_min(&right)?;
                Ok(Some(self.balance(succ_key, succ_value, left, new_right)?))
            }
        }
    }

    /// Removes the minimum of a non-empty subtree, returning its key and
    /// value and the copied remainder.
    fn take_min(&mut self, ptr: &NodePtr) -> Result<(Vec<u8>, Vec<u8>, NodePtr)> {
        let node = self
            .load(ptr)?
            .ok_or_else(|| eyre!("take_min on empty subtree"))?;
        let left = node.left();
        if self.load(&left)?.is_none() {
            return Ok((node.key().to_vec(), node.value().to_vec(), node.right()));
        }
        let (min_key, min_value, new_left) = self.take_min(&left)?;
        let rebuilt = self.balance(
            node.key().to_vec(),
            node.value().to_vec(),
            new_left,
            node.right(),
        )?;
        Ok((min_key, min_value, rebuilt))
    }

    /// Builds the node `(key, value, left, right)`, rotating if the two
    /// subtrees' heights differ by more than one.
    fn balance(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        left: NodePtr,
        right: NodePtr,
    ) -> Result<NodePtr> {
        let lh = i32::from(self.height_of(&left)?);
        let rh = i32::from(self.height_of(&right)?);
        if lh - rh > 1 {
            let l = self
                .load(&left)?
                .ok_or_else(|| eyre!("left subtree vanished during rebalance"))?;
            let ll = l.left();
            let lr = l.right();
            if self.height_of(&ll)? >= self.height_of(&lr)? {
                // single right rotation
                let new_right = self.mk_node(key, value, lr, right)?;
                self.mk_node(l.key().to_vec(), l.value().to_vec(), ll, new_right)
            } else {
                // left-right double rotation
                let pivot = self
                    .load(&lr)?
                    .ok_or_else(|| eyre!("rotation pivot vanished during rebalance"))?;
                let new_left = self.mk_node(l.key().to_vec(), l.value().to_vec(), ll, pivot.left())?;
                let new_right = self.mk_node(key, value, pivot.right(), right)?;
                self.mk_node(
                    pivot.key().to_vec(),
                    pivot.value().to_vec(),
                    new_left,
                    new_right,
                )
            }
        } else if rh - lh > 1 {
            let r = self
                .load(&right)?
                .ok_or_else(|| eyre!("right subtree vanished during rebalance"))?;
            let rl = r.left();
            let rr = r.right();
            if self.height_of(&rr)? >= self.height_of(&rl)? {
                // single left rotation
                let new_left = self.mk_node(key, value, left, rl)?;
                self.mk_node(r.key().to_vec(), r.value().to_vec(), new_left, rr)
            } else {
                // right-left double rotation
                let pivot = self
                    .load(&rl)?
                    .ok_or_else(|| eyre!("rotation pivot vanished during rebalance"))?;
                let new_left = self.mk_node(key, value, left, pivot.left())?;
                let new_right = self.mk_node(r.key().to_vec(), r.value().to_vec(), pivot.right(), rr)?;
                self.mk_node(
                    pivot.key().to_vec(),
                    pivot.value().to_vec(),
                    new_left,
                    new_right,
                )
            }
        } else {
            self.mk_node(key, value, left, right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use crate::service::EntryService;

    fn empty_tree() -> PersistentTree {
        let log = Arc::new(MemLog::new());
        let entries = Arc::new(EntryService::new(log));
        let store = Arc::new(NodeStore::new(entries, 1024));
        PersistentTree::at(store, NodePtr::Nil, -1)
    }

    fn put_str(tree: &mut PersistentTree, key: &str, value: &str) {
        tree.put(key.as_bytes(), value.as_bytes()).unwrap();
    }

    fn get_str(tree: &PersistentTree, key: &str) -> Option<String> {
        tree.get(key.as_bytes())
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    fn max_height(tree: &PersistentTree, ptr: &NodePtr) -> u32 {
        match tree.load(ptr).unwrap() {
            None => 0,
            Some(node) => {
                let l = max_height(tree, &node.left());
                let r = max_height(tree, &node.right());
                assert_eq!(u32::from(node.height()), 1 + l.max(r));
                assert!(l.abs_diff(r) <= 1, "unbalanced at {:?}", node);
                1 + l.max(r)
            }
        }
    }

    #[test]
    fn put_then_get() {
        let mut tree = empty_tree();
        put_str(&mut tree, "a", "1");
        assert_eq!(get_str(&tree, "a").as_deref(), Some("1"));
        assert_eq!(get_str(&tree, "b"), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut tree = empty_tree();
        put_str(&mut tree, "k", "old");
        put_str(&mut tree, "k", "new");
        assert_eq!(get_str(&tree, "k").as_deref(), Some("new"));
    }

    #[test]
    fn delete_removes_key() {
        let mut tree = empty_tree();
        put_str(&mut tree, "a", "1");
        put_str(&mut tree, "b", "2");
        tree.delete(b"a").unwrap();
        assert_eq!(get_str(&tree, "a"), None);
        assert_eq!(get_str(&tree, "b").as_deref(), Some("2"));
    }

    #[test]
    fn delete_of_absent_key_is_a_tree_noop() {
        let mut tree = empty_tree();
        tree.delete(b"missing").unwrap();
        assert!(tree.is_read_only());
        tree.seal();
        assert!(tree.delta().is_empty());
    }

    #[test]
    fn delete_internal_node_keeps_both_subtrees() {
        let mut tree = empty_tree();
        for key in ["d", "b", "f", "a", "c", "e", "g"] {
            put_str(&mut tree, key, key);
        }
        tree.delete(b"d").unwrap();
        assert_eq!(get_str(&tree, "d"), None);
        for key in ["a", "b", "c", "e", "f", "g"] {
            assert_eq!(get_str(&tree, key).as_deref(), Some(key));
        }
        max_height(&tree, &tree.root());
    }

    #[test]
    fn stays_balanced_under_sequential_inserts() {
        let mut tree = empty_tree();
        for i in 0..128u32 {
            let key = format!("{i:04}");
            put_str(&mut tree, &key, "v");
        }
        let height = max_height(&tree, &tree.root());
        // 1.44 * log2(128) is just over 10
        assert!(height <= 11, "height {height} for 128 keys");
        for i in 0..128u32 {
            assert_eq!(get_str(&tree, &format!("{i:04}")).as_deref(), Some("v"));
        }
    }

    #[test]
    fn stays_balanced_under_mixed_workload() {
        let mut tree = empty_tree();
        for i in 0..96u32 {
            put_str(&mut tree, &format!("{:04}", (i * 37) % 96), "v");
        }
        for i in 0..48u32 {
            tree.delete(format!("{:04}", (i * 2) % 96).as_bytes()).unwrap();
        }
        max_height(&tree, &tree.root());
        for i in 0..96u32 {
            let key = format!("{i:04}");
            let expect = i % 2 == 1;
            assert_eq!(get_str(&tree, &key).is_some(), expect, "key {key}");
        }
    }

    #[test]
    fn snapshot_is_isolated_from_later_versions() {
        let mut tree = empty_tree();
        put_str(&mut tree, "a", "1");
        put_str(&mut tree, "b", "2");
        let snapshot = tree.root();

        put_str(&mut tree, "a", "changed");
        tree.delete(b"b").unwrap();

        let store = Arc::clone(&tree.store);
        let old = PersistentTree::at(store, snapshot, -2);
        assert_eq!(get_str(&old, "a").as_deref(), Some("1"));
        assert_eq!(get_str(&old, "b").as_deref(), Some("2"));
        assert_eq!(get_str(&tree, "a").as_deref(), Some("changed"));
        assert_eq!(get_str(&tree, "b"), None);
    }

    #[test]
    fn fresh_tree_is_read_only() {
        let mut tree = empty_tree();
        assert!(tree.is_read_only());
        assert_eq!(tree.get(b"nothing").unwrap(), None);
        assert!(tree.is_read_only());
        put_str(&mut tree, "k", "v");
        assert!(!tree.is_read_only());
    }

    #[test]
    fn seal_collects_only_reachable_private_nodes() {
        let mut tree = empty_tree();
        put_str(&mut tree, "a", "1");
        put_str(&mut tree, "b", "2");
        put_str(&mut tree, "a", "3");
        tree.seal();
        // orphaned intermediate copies are not part of the delta
        assert_eq!(tree.delta().len(), 2);
        let slots: Vec<u32> = tree.delta().iter().map(|n| n.slot()).collect();
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn stamping_gives_delta_nodes_durable_identity() {
        let mut tree = empty_tree();
        put_str(&mut tree, "a", "1");
        tree.seal();
        tree.set_intention(12);
        assert!(tree.delta().iter().all(|n| n.rid() == 12));
        let root_ref = tree.sealed_root_ref().unwrap();
        assert!(matches!(root_ref, NodePtr::Remote { pos: 12, slot: 0 }));
    }

    #[test]
    fn after_image_round_trips_through_a_store() {
        let mut tree = empty_tree();
        for key in ["m", "c", "t", "a", "e"] {
            put_str(&mut tree, key, key);
        }
        tree.seal();
        tree.set_intention(0);
        let image = tree.to_after_image().unwrap();
        assert_eq!(image.intention_pos(), 0);
        assert_eq!(image.nodes().len(), tree.delta().len());

        // feed the image through a log-backed store and read it back
        use crate::encoding::encode_after_image;
        use crate::log::SharedLog;
        let log = Arc::new(MemLog::new());
        log.append(b"intention placeholder").unwrap();
        log.append(&encode_after_image(&image)).unwrap();
        let entries = Arc::new(EntryService::new(log));
        let store = Arc::new(NodeStore::new(entries, 1024));
        let root = tree.sealed_root_ref().unwrap();
        let rebuilt = PersistentTree::at(store, root, -5);
        for key in ["m", "c", "t", "a", "e"] {
            assert_eq!(get_str(&rebuilt, key).as_deref(), Some(key));
        }
        assert_eq!(get_str(&rebuilt, "zz"), None);
    }
}
