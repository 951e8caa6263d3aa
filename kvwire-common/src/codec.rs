//! # RESP Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies over any byte
//! source that can hand out whole lines and exact byte counts.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down by one recursive
//!    function; array depth is bounded by the counts on the wire.
//! 2. **Source Agnostic**: `ReplyRead` is the only I/O seam, so deadline
//!    handling stays in the socket layer below the codec.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Lenient Numbers**: Malformed integer payloads decode as 0.
//! 5. **Whole Replies**: A reply abandoned on a timeout is rewound, so the
//!    next read starts at its first byte instead of in the middle of it.

use std::io::{self, BufRead, BufReader, Cursor, Read};

use bytes::Bytes;

use crate::error::{CodecError, CodecResult};
use crate::reply::{Arg, CommandError, Reply};

const CRLF: &[u8; 2] = b"\r\n";

/// Largest bulk payload accepted, matching the server's default
/// `proto-max-bulk-len`.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

// Bulk payloads from a plain reader are read in slices of at most this size.
const BULK_READ_SLICE: usize = 64 * 1024;

/// Byte source the decoder pulls from.
///
/// `read_line` returns one line without its trailing CRLF. `read_exact_bytes`
/// returns exactly `len` bytes. Both block until the data is there or the
/// source fails.
pub trait ReplyRead {
    fn read_line(&mut self) -> io::Result<Bytes>;

    fn read_exact_bytes(&mut self, len: usize) -> io::Result<Bytes>;

    /// Called before the first byte of each reply.
    fn begin_reply(&mut self) {}

    /// Called when a reply times out part way. Sources that can should make
    /// the next `begin_reply` see the reply from its first byte again.
    fn rewind_reply(&mut self) {}
}

impl<R: Read> ReplyRead for BufReader<R> {
    fn read_line(&mut self) -> io::Result<Bytes> {
        read_crlf_line(self)
    }

    fn read_exact_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        read_exact_from(self, len)
    }
}

impl<T: AsRef<[u8]>> ReplyRead for Cursor<T> {
    fn read_line(&mut self) -> io::Result<Bytes> {
        read_crlf_line(self)
    }

    fn read_exact_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        read_exact_from(self, len)
    }
}

/// Encodes a command as a RESP array of bulk strings into `out`.
///
/// `Arg::Multi` elements are spliced in place, so the array count is the
/// number of flattened arguments.
pub fn encode_command(args: &[Arg], out: &mut Vec<u8>) {
    let count: usize = args.iter().map(Arg::width).sum();
    out.push(b'*');
    push_usize(out, count);
    out.extend_from_slice(CRLF);
    for part in args.iter().flat_map(Arg::parts) {
        out.push(b'$');
        push_usize(out, part.len());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(part);
        out.extend_from_slice(CRLF);
    }
}

/// Reads one complete reply, recursing into multi-bulk elements.
///
/// On a timeout the source is rewound to the start of the reply.
pub fn read_reply<R: ReplyRead + ?Sized>(reader: &mut R) -> CodecResult<Reply> {
    reader.begin_reply();
    let reply = read_value(reader);
    if matches!(&reply, Err(err) if err.is_timeout()) {
        reader.rewind_reply();
    }
    reply
}

fn read_value<R: ReplyRead + ?Sized>(reader: &mut R) -> CodecResult<Reply> {
    let line = reader.read_line()?;
    let (&sigil, rest) = line
        .split_first()
        .ok_or_else(|| CodecError::Protocol("empty reply line".to_string()))?;

    match sigil {
        b'-' => Ok(Reply::Error(CommandError::new(trimmed(rest)))),
        b'+' => Ok(Reply::Status(trimmed(rest))),
        b':' => Ok(Reply::Integer(parse_i64_lenient(rest))),
        b'$' => read_bulk(reader, parse_i64_lenient(rest)),
        b'*' => read_multi_bulk(reader, parse_i64_lenient(rest)),
        other => Err(CodecError::UnexpectedSigil(other)),
    }
}

fn read_bulk<R: ReplyRead + ?Sized>(reader: &mut R, len: i64) -> CodecResult<Reply> {
    if len < 0 {
        return Ok(Reply::Bulk(None));
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_BULK_LEN)
        .ok_or_else(|| CodecError::Protocol(format!("invalid bulk length {len}")))?;
    let data = reader.read_exact_bytes(len)?;
    // Trailing CRLF is discarded unchecked.
    reader.read_exact_bytes(CRLF.len())?;
    Ok(Reply::Bulk(Some(data)))
}

fn read_multi_bulk<R: ReplyRead + ?Sized>(reader: &mut R, count: i64) -> CodecResult<Reply> {
    if count < 0 {
        return Ok(Reply::MultiBulk(None));
    }

    // Cap the preallocation; the count comes straight off the wire.
    let mut items = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        items.push(read_value(reader)?);
    }
    Ok(Reply::MultiBulk(Some(items)))
}

fn trimmed(data: &[u8]) -> String {
    String::from_utf8_lossy(data.trim_ascii()).into_owned()
}

fn parse_i64_lenient(data: &[u8]) -> i64 {
    std::str::from_utf8(data.trim_ascii())
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(0)
}

fn read_crlf_line<R: BufRead>(reader: &mut R) -> io::Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    loop {
        let bytes = reader.read_until(b'\n', &mut buf)?;
        if bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed before end of line",
            ));
        }
        // A bare LF belongs to the line; keep scanning for CRLF.
        if buf.ends_with(CRLF) {
            buf.truncate(buf.len() - CRLF.len());
            return Ok(Bytes::from(buf));
        }
    }
}

fn read_exact_from<R: Read>(reader: &mut R, len: usize) -> io::Result<Bytes> {
    // Grow with the data actually received, not with the announced length.
    let mut data = Vec::with_capacity(len.min(BULK_READ_SLICE));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed inside a bulk payload",
        ));
    }
    Ok(Bytes::from(data))
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Digits are written into a stack buffer, then copied in order.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.extend_from_slice(&buf[..len]);
}
