//! # Persistent Tree Module
//!
//! The copy-on-write search tree and its supporting cast:
//!
//! - `node`: immutable tree nodes and the `Nil | Resident | Remote`
//!   pointer sum;
//! - `store`: the shared bounded cache resolving `(intention_pos, slot)`
//!   identities, demand-loading after-images from the log;
//! - `tree`: the AVL tree itself - snapshot reads, path-copying mutation,
//!   delta collection, and after-image serialization.
//!
//! Readers holding a root pointer need no locks: everything reachable from
//! a published root is immutable.

mod node;
mod store;
#[allow(clippy::module_inception)]
mod tree;

pub use node::{Node, NodePtr, SharedNode, UNASSIGNED_SLOT};
pub use store::NodeStore;
pub use tree::PersistentTree;
