//! Fixed-size relay buffer.
//!
//! Each connection owns one buffer. It is filled only by reads on that
//! connection and drained only by writes to its peer. A short write keeps the
//! unsent tail, moved to the front of the buffer, for the next writable event.

use std::fmt;
use std::io::{self, Read, Write};

/// Capacity of a relay buffer in bytes.
pub const BUFFER_SIZE: usize = 1024;

/// Outcome of a flush that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything was written; the buffer is empty.
    Drained(usize),
    /// The writer stopped accepting bytes; the remainder stays buffered.
    Partial(usize),
}

/// Bytes read from one side and not yet written to the other.
pub struct RelayBuffer {
    data: [u8; BUFFER_SIZE],
    len: usize,
}

impl RelayBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == BUFFER_SIZE
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Read once from `src`, appending after any bytes already held.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means end of stream. A
    /// full buffer reports `WouldBlock` so callers treat it like a source that
    /// has nothing to give yet.
    pub fn fill_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "relay buffer full",
            ));
        }
        loop {
            match src.read(&mut self.data[self.len..]) {
                Ok(n) => {
                    self.len += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much as `dst` accepts.
    ///
    /// `WouldBlock` from the writer ends the flush without error. A writer
    /// that accepts zero bytes, or fails hard, is an error; whatever was
    /// written before that point is still removed from the buffer.
    pub fn flush_into<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<Flush> {
        let mut written = 0;
        while written < self.len {
            match dst.write(&self.data[written..self.len]) {
                Ok(0) => {
                    self.consume(written);
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.consume(written);
                    return Err(e);
                }
            }
        }
        self.consume(written);
        if self.is_empty() {
            Ok(Flush::Drained(written))
        } else {
            Ok(Flush::Partial(written))
        }
    }

    fn consume(&mut self, n: usize) {
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBuffer").field("len", &self.len).finish()
    }
}
