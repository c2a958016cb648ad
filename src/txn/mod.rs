//! # Transaction Module
//!
//! Everything a transaction is made of:
//!
//! - `intention`: the ordered op record appended to the log at commit;
//! - `handle`: the per-client façade collecting reads and writes into a
//!   private tree and intention;
//! - `processor`: the single worker that consumes intentions in log order,
//!   validates them against committed state, and publishes new roots.

mod handle;
mod intention;
mod processor;

pub use handle::Transaction;
pub use intention::{Intention, Op};
pub use processor::TransactionProcessor;
