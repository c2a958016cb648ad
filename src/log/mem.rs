//! In-memory shared log. Dense positions, no holes, no durability; the
//! backing store for unit and scenario tests and for embedding without a
//! filesystem.

use eyre::Result;
use parking_lot::Mutex;

use super::SharedLog;

#[derive(Default)]
pub struct MemLog {
    entries: Mutex<Vec<Vec<u8>>>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedLog for MemLog {
    fn append(&self, blob: &[u8]) -> Result<u64> {
        let mut entries = self.entries.lock();
        entries.push(blob.to_vec());
        Ok((entries.len() - 1) as u64)
    }

    fn read(&self, pos: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(pos as usize).cloned())
    }

    fn tail(&self) -> Result<u64> {
        Ok(self.entries.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_dense_positions() {
        let log = MemLog::new();
        assert_eq!(log.append(b"a").unwrap(), 0);
        assert_eq!(log.append(b"b").unwrap(), 1);
        assert_eq!(log.tail().unwrap(), 2);
    }

    #[test]
    fn read_returns_appended_blob() {
        let log = MemLog::new();
        log.append(b"hello").unwrap();
        assert_eq!(log.read(0).unwrap().as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn read_past_tail_is_none() {
        let log = MemLog::new();
        assert_eq!(log.read(0).unwrap(), None);
        log.append(b"x").unwrap();
        assert_eq!(log.read(5).unwrap(), None);
    }
}
