//! Byte accumulation for stream output.
//!
//! [`StringBuffer`] collects the chunks a child process writes and hands
//! them back in caller-defined units: fixed sizes, delimiter-terminated
//! records, or regex-terminated records.

use regex::bytes::Regex;

use crate::error::{Result, SpawnerError};

/// An append-only byte buffer with consuming reads.
#[derive(Debug, Default)]
pub struct StringBuffer {
    data: Vec<u8>,
    closed: bool,
}

impl StringBuffer {
    pub fn new() -> Self {
        StringBuffer::default()
    }

    /// Append a chunk to the buffer.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_open()?;
        self.data.extend_from_slice(chunk.as_ref());
        Ok(())
    }

    /// Consume and return up to `n` bytes; `None` when the buffer is empty.
    pub fn read(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = n.min(self.data.len());
        Ok(Some(self.data.drain(..n).collect()))
    }

    /// Consume and return everything buffered; `None` when empty.
    pub fn read_all(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if self.data.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.data)))
    }

    /// Consume and return bytes through the first occurrence of `delim`
    /// inclusive; `None` when no complete record is buffered yet.
    pub fn read_until(&mut self, delim: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let delim = delim.as_ref();
        if delim.is_empty() || self.data.len() < delim.len() {
            return Ok(None);
        }
        let found = self
            .data
            .windows(delim.len())
            .position(|window| window == delim);
        match found {
            Some(pos) => Ok(Some(self.data.drain(..pos + delim.len()).collect())),
            None => Ok(None),
        }
    }

    /// Consume and return bytes through the end of the first match of
    /// `regex`; `None` when nothing matches yet.
    pub fn read_until_regex(&mut self, regex: &Regex) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        match regex.find(&self.data) {
            Some(found) => Ok(Some(self.data.drain(..found.end()).collect())),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Close the buffer; subsequent feeds and reads fail.
    pub fn close(&mut self) {
        self.closed = true;
        self.data.clear();
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SpawnerError::BufferClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_in_chunks() {
        let mut buf = StringBuffer::new();
        buf.feed(b"hello world").unwrap();
        assert_eq!(buf.read(5).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(buf.read(6).unwrap().as_deref(), Some(&b" world"[..]));
        assert_eq!(buf.read(100).unwrap(), None);
    }

    #[test]
    fn read_all_concatenates_feeds() {
        let mut buf = StringBuffer::new();
        buf.feed(b"hello").unwrap();
        buf.feed(b" ").unwrap();
        buf.feed(b"world").unwrap();
        assert_eq!(buf.read_all().unwrap().as_deref(), Some(&b"hello world"[..]));
        assert_eq!(buf.read(100).unwrap(), None);
    }

    #[test]
    fn read_until_delimiter() {
        let mut buf = StringBuffer::new();
        buf.feed(b"hello\nworld\n").unwrap();
        assert_eq!(buf.read_until(b"\n").unwrap().as_deref(), Some(&b"hello\n"[..]));
        assert_eq!(buf.read_until(b"\n").unwrap().as_deref(), Some(&b"world\n"[..]));
        assert_eq!(buf.read_until(b"\n").unwrap(), None);
    }

    #[test]
    fn read_until_partial_record_stays_buffered() {
        let mut buf = StringBuffer::new();
        buf.feed(b"no newline yet").unwrap();
        assert_eq!(buf.read_until(b"\n").unwrap(), None);
        assert_eq!(buf.read_all().unwrap().as_deref(), Some(&b"no newline yet"[..]));
    }

    #[test]
    fn read_until_regex_matches() {
        let regex = Regex::new("~~").unwrap();
        let mut buf = StringBuffer::new();
        buf.feed(b"hello~~world~~").unwrap();
        assert_eq!(
            buf.read_until_regex(&regex).unwrap().as_deref(),
            Some(&b"hello~~"[..])
        );
        assert_eq!(
            buf.read_until_regex(&regex).unwrap().as_deref(),
            Some(&b"world~~"[..])
        );
        assert_eq!(buf.read_until_regex(&regex).unwrap(), None);
    }

    #[test]
    fn clear_discards_content() {
        let mut buf = StringBuffer::new();
        buf.feed(b"hello world").unwrap();
        buf.clear();
        assert_eq!(buf.read(5).unwrap(), None);
    }

    #[test]
    fn closed_buffer_rejects_reads() {
        let mut buf = StringBuffer::new();
        buf.feed(b"hello world").unwrap();
        buf.close();
        assert!(buf.closed());
        assert_eq!(buf.read(5), Err(SpawnerError::BufferClosed));
        assert_eq!(buf.feed(b"more"), Err(SpawnerError::BufferClosed));
    }
}
