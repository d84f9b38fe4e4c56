//! Bounded scrollback for late-joining subscribers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Default scrollback capacity per agent.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Fixed-capacity circular byte buffer. A single writer (the owning
/// session's flush path) appends; readers take a chronological copy.
/// Access is serialized by the owning session.
#[derive(Debug)]
pub struct Scrollback {
    buf: Vec<u8>,
    cursor: usize,
    full: bool,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            cursor: 0,
            full: false,
        }
    }

    /// Append bytes, overwriting the oldest data once capacity is reached.
    /// A write at least as large as the capacity replaces the whole buffer
    /// with its final `capacity` bytes.
    pub fn write(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        if cap == 0 || data.is_empty() {
            return;
        }
        if data.len() >= cap {
            self.buf.copy_from_slice(&data[data.len() - cap..]);
            self.cursor = 0;
            self.full = true;
            return;
        }

        let first = (cap - self.cursor).min(data.len());
        self.buf[self.cursor..self.cursor + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }

        let next = self.cursor + data.len();
        if next >= cap {
            self.full = true;
        }
        self.cursor = next % cap;
    }

    /// Stored bytes in chronological order.
    pub fn read(&self) -> Vec<u8> {
        if self.full {
            let mut out = Vec::with_capacity(self.buf.len());
            out.extend_from_slice(&self.buf[self.cursor..]);
            out.extend_from_slice(&self.buf[..self.cursor]);
            out
        } else {
            self.buf[..self.cursor].to_vec()
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.read())
    }

    pub fn len(&self) -> usize {
        if self.full { self.buf.len() } else { self.cursor }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}
