//! # File-Backed Shared Log
//!
//! A durable [`SharedLog`] over a single append-only file of checksummed
//! frames. Positions are frame indices; an in-memory offset index is
//! rebuilt by scanning the file at open.
//!
//! ## Frame Format
//!
//! ```text
//! +------------------+------------------+
//! | Frame Header     | Payload          |
//! | (16 bytes)       | (len bytes)      |
//! +------------------+------------------+
//! ```
//!
//! The header carries the payload length and a CRC-64 checksum over the
//! length and payload. Variable-length payloads are the difference from a
//! page-image WAL; everything else about the write path is the same: write
//! header plus payload, then sync before acknowledging the append.
//!
//! ## Open Protocol
//!
//! 1. Scan frames from offset 0.
//! 2. A short header, a short payload, an implausible length, or a checksum
//!    mismatch ends the scan: everything before it is the valid prefix.
//! 3. Truncate the file to the valid prefix. A torn tail is the expected
//!    outcome of a crash mid-append and is discarded silently apart from a
//!    warning.
//!
//! ## Read Path
//!
//! Reads go through a cached `memmap2::Mmap` of the file. The mapping is
//! invalidated on every append and recreated lazily, so a reader never
//! observes a frame the index does not yet cover. Checksums are verified on
//! every read; a mismatch under an intact index is corruption and fails the
//! read.
//!
//! ## Concurrency
//!
//! Appends are serialized by the inner mutex. Readers take the inner lock
//! only to look up the frame offset, then the map lock to copy the payload.
//! The lock order is inner before map everywhere, and no lock is held
//! across a sync.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::SharedLog;
use crate::config::MAX_FRAME_PAYLOAD;

pub const FRAME_HEADER_SIZE: usize = 16;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FrameHeader {
    pub len: u32,
    _reserved: u32,
    pub checksum: u64,
}

impl FrameHeader {
    pub fn new(len: u32, checksum: u64) -> Self {
        Self {
            len,
            _reserved: 0,
            checksum,
        }
    }
}

fn compute_checksum(payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&(payload.len() as u32).to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

struct LogInner {
    file: File,
    /// Byte offset and payload length of every intact frame, by position.
    frames: Vec<(u64, u32)>,
    /// End of the last intact frame; the next append lands here.
    end: u64,
}

pub struct FileLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
    read_map: RwLock<Option<Mmap>>,
}

impl FileLog {
    /// Opens or creates the log at `path`, scanning existing frames to
    /// rebuild the position index and truncating any torn tail.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open log file at {path:?}"))?;

        let file_len = file
            .metadata()
            .wrap_err("failed to stat log file")?
            .len();
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to start of log file")?;

        let mut frames = Vec::new();
        let mut offset = 0u64;
        while offset + FRAME_HEADER_SIZE as u64 <= file_len {
            let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
            file.read_exact(&mut header_bytes)
                .wrap_err("failed to read frame header")?;
            let header = match FrameHeader::read_from_bytes(&header_bytes) {
                Ok(header) => header,
                Err(_) => break,
            };
            let len = u64::from(header.len);
            if len > MAX_FRAME_PAYLOAD || offset + FRAME_HEADER_SIZE as u64 + len > file_len {
                break;
            }
            let mut payload = vec![0u8; header.len as usize];
            file.read_exact(&mut payload)
                .wrap_err("failed to read frame payload")?;
            if compute_checksum(&payload) != header.checksum {
                break;
            }
            frames.push((offset, header.len));
            offset += FRAME_HEADER_SIZE as u64 + len;
        }

        if offset < file_len {
            tracing::warn!(
                discarded = file_len - offset,
                path = ?path,
                "discarding torn log tail"
            );
            file.set_len(offset)
                .wrap_err("failed to truncate torn log tail")?;
        }
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to log end")?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LogInner {
                file,
                frames,
                end: offset,
            }),
            read_map: RwLock::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SharedLog for FileLog {
    fn append(&self, blob: &[u8]) -> Result<u64> {
        ensure!(
            (blob.len() as u64) <= MAX_FRAME_PAYLOAD,
            "log entry of {} bytes exceeds frame limit",
            blob.len()
        );

        let mut inner = self.inner.lock();
        let header = FrameHeader::new(blob.len() as u32, compute_checksum(blob));
        let offset = inner.end;
        inner
            .file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to log end")?;
        inner
            .file
            .write_all(header.as_bytes())
            .wrap_err("failed to write frame header")?;
        inner
            .file
            .write_all(blob)
            .wrap_err("failed to write frame payload")?;
        inner
            .file
            .sync_all()
            .wrap_err("failed to sync log frame")?;

        let pos = inner.frames.len() as u64;
        inner.frames.push((offset, blob.len() as u32));
        inner.end = offset + (FRAME_HEADER_SIZE + blob.len()) as u64;
        drop(inner);

        *self.read_map.write() = None;
        Ok(pos)
    }

    fn read(&self, pos: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let (offset, len) = match inner.frames.get(pos as usize) {
            Some(&(offset, len)) => (offset, len as usize),
            None => return Ok(None),
        };
        let frame_end = offset as usize + FRAME_HEADER_SIZE + len;

        let mut map_guard = self.read_map.write();
        let stale = match map_guard.as_ref() {
            None => true,
            Some(map) => map.len() < frame_end,
        };
        if stale {
            let map = unsafe { Mmap::map(&inner.file) }
                .wrap_err_with(|| format!("failed to mmap log file at {:?}", self.path))?;
            ensure!(
                map.len() >= frame_end,
                "log mapping of {} bytes does not cover frame at offset {offset}",
                map.len()
            );
            *map_guard = Some(map);
        }
        drop(inner);

        let map = match map_guard.as_ref() {
            Some(map) => map,
            None => bail!("log mapping vanished during read"),
        };
        let header_start = offset as usize;
        let header = FrameHeader::read_from_bytes(&map[header_start..header_start + FRAME_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("invalid frame header at offset {offset}: {e:?}"))?;
        let payload = &map[header_start + FRAME_HEADER_SIZE..frame_end];
        if compute_checksum(payload) != header.checksum {
            bail!("checksum mismatch in log frame at position {pos}");
        }
        Ok(Some(payload.to_vec()))
    }

    fn tail(&self) -> Result<u64> {
        Ok(self.inner.lock().frames.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(&dir.path().join("shared.log")).unwrap();
        assert_eq!(log.append(b"first").unwrap(), 0);
        assert_eq!(log.append(b"second entry").unwrap(), 1);
        assert_eq!(log.read(0).unwrap().as_deref(), Some(b"first".as_slice()));
        assert_eq!(
            log.read(1).unwrap().as_deref(),
            Some(b"second entry".as_slice())
        );
        assert_eq!(log.read(2).unwrap(), None);
        assert_eq!(log.tail().unwrap(), 2);
    }

    #[test]
    fn reopen_recovers_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        {
            let log = FileLog::open(&path).unwrap();
            log.append(b"a").unwrap();
            log.append(b"bb").unwrap();
            log.append(b"ccc").unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.tail().unwrap(), 3);
        assert_eq!(log.read(1).unwrap().as_deref(), Some(b"bb".as_slice()));
        assert_eq!(log.append(b"dddd").unwrap(), 3);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        {
            let log = FileLog::open(&path).unwrap();
            log.append(b"intact").unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.tail().unwrap(), 1);
        assert_eq!(log.read(0).unwrap().as_deref(), Some(b"intact".as_slice()));
        assert_eq!(log.append(b"next").unwrap(), 1);
        assert_eq!(log.read(1).unwrap().as_deref(), Some(b"next".as_slice()));
    }

    #[test]
    fn corrupt_payload_ends_scan_at_frame_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        let second_offset = {
            let log = FileLog::open(&path).unwrap();
            log.append(b"keep").unwrap();
            log.append(b"mangle me").unwrap();
            let inner = log.inner.lock();
            inner.frames[1].0
        };
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(second_offset + FRAME_HEADER_SIZE as u64))
                .unwrap();
            file.write_all(b"X").unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.tail().unwrap(), 1);
        assert_eq!(log.read(0).unwrap().as_deref(), Some(b"keep".as_slice()));
    }

    #[test]
    fn empty_payloads_are_legal() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(&dir.path().join("shared.log")).unwrap();
        log.append(b"").unwrap();
        assert_eq!(log.read(0).unwrap().as_deref(), Some(b"".as_slice()));
    }
}
