//! # StrandDB - Log-Structured Multi-Version Key-Value Store
//!
//! StrandDB keeps its entire state in an append-only shared log. Clients
//! run transactions against a snapshot of a copy-on-write search tree;
//! commit is proposed by appending an *intention* - the ordered record of
//! the transaction's reads and writes - to the log. A single transaction
//! processor per log consumes intentions in log order, validates each one
//! against committed state, and materializes the winners' new tree nodes
//! as *after-images* appended back to the log. The log is the database;
//! everything in memory is a cache over it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stranddb::{Database, MemLog};
//!
//! let log = Arc::new(MemLog::new());
//! let db = Database::open(log, 0)?;
//!
//! let mut txn = db.begin()?;
//! txn.put(b"k", b"v")?;
//! assert!(txn.commit()?);
//!
//! let mut txn = db.begin()?;
//! assert_eq!(txn.get(b"k")?.as_deref(), Some(b"v".as_ref()));
//! assert!(txn.commit()?);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Public API (Database, Txn)        │
//! ├─────────────────────────────────────────┤
//! │  Transaction Processor │ Txn Handles     │
//! ├────────────────────────┴────────────────┤
//! │  Persistent Tree (copy-on-write AVL)     │
//! ├─────────────────────────────────────────┤
//! │  Node Store (demand-load + bounded cache)│
//! ├─────────────────────────────────────────┤
//! │  Entry Service (tail reader, dispatcher, │
//! │  entry cache, after-image matcher)       │
//! ├─────────────────────────────────────────┤
//! │  Shared Log (MemLog / FileLog / yours)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Model
//!
//! Transactions run under serializable-snapshot validation: a transaction
//! with snapshot `s` committing at log position `p` succeeds iff no
//! intention that committed in `(s, p)` wrote a key the transaction read
//! or wrote. The log's total order of positions is the only clock in the
//! system; ties cannot occur.
//!
//! ## Module Overview
//!
//! - [`log`]: the shared log contract and the bundled in-memory and
//!   file-backed implementations
//! - [`encoding`]: wire framing for intentions and after-images
//! - [`tree`]: the copy-on-write tree, its nodes, and the node store
//! - [`txn`]: intentions, transaction handles, the transaction processor
//! - [`service`]: the log-following entry service
//! - [`database`]: the handle wiring it all together
//! - [`config`]: tuning constants

pub mod config;
pub mod database;
pub mod encoding;
pub mod log;
pub mod service;
pub mod tree;
pub mod txn;

pub use database::Database;
pub use log::{FileLog, MemLog, SharedLog};
pub use txn::Transaction;
