//! # Encoding Module
//!
//! Wire formats for the shared log: variable-length integers and the tagged
//! log entry framing (intentions and after-images). Fixed-layout file
//! framing for the durable log lives with the log itself in [`crate::log`];
//! this module owns everything that crosses the log as entry payload.
//!
//! All encodings are little-endian and self-delimiting; decoding is strict
//! and treats any malformed input as an error the caller escalates to a
//! fatal, database-poisoning condition.

pub mod entry;
pub mod varint;

pub use entry::{
    encode_after_image, encode_intention, AfterImage, ImageNode, LogEntry, NodeRef,
};
pub use varint::{decode_u64, encode_u64, MAX_VARINT_LEN};
