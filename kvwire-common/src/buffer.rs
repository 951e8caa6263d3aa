//! # Rewindable Reply Buffer
//!
//! Purpose: Hold received bytes until a whole reply has been parsed, so a
//! read that gives up halfway can start the same reply over later.
//!
//! ## Design Principles
//! 1. **Read Position, Not Consumption**: Lines and payloads advance a
//!    cursor; bytes stay in the buffer until `checkpoint`.
//! 2. **One Mark**: The mark is always the start of the buffer. `checkpoint`
//!    drops what the previous reply used, `rewind` returns to the mark.

use bytes::{Buf, Bytes, BytesMut};

/// Receive buffer with a read cursor that can be rewound to the last
/// checkpoint.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    data: BytesMut,
    pos: usize,
    // Where the last unsuccessful CRLF scan stopped.
    scanned: usize,
}

impl ReplyBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ReplyBuffer {
            data: BytesMut::with_capacity(capacity),
            pos: 0,
            scanned: 0,
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Bytes received but not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Takes the next CRLF-terminated line, without the CRLF.
    pub fn take_line(&mut self) -> Option<Bytes> {
        // Resume one byte back in case a CR ended the previous scan.
        let from = self.scanned.saturating_sub(1).max(self.pos);
        match self.data[from..].windows(2).position(|window| window == b"\r\n") {
            Some(offset) => {
                let end = from + offset;
                let line = Bytes::copy_from_slice(&self.data[self.pos..end]);
                self.pos = end + 2;
                self.scanned = self.pos;
                Some(line)
            }
            None => {
                self.scanned = self.data.len();
                None
            }
        }
    }

    /// Takes exactly `len` bytes, or nothing if fewer are buffered.
    pub fn take_exact(&mut self, len: usize) -> Option<Bytes> {
        if self.remaining() < len {
            return None;
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        self.scanned = self.pos;
        Some(bytes)
    }

    /// Releases everything read so far and marks the current position.
    pub fn checkpoint(&mut self) {
        self.data.advance(self.pos);
        self.pos = 0;
        self.scanned = 0;
    }

    /// Moves the cursor back to the last checkpoint.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.scanned = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.rewind();
    }
}
