//! # Reply and Argument Types
//!
//! Purpose: Typed values exchanged with the server. `Reply` is what the codec
//! decodes; `Arg` is what callers hand to the encoder.
//!
//! ## Design Principles
//! 1. **Exact Nulls**: `Bulk(None)` and `MultiBulk(None)` keep `$-1` and `*-1`
//!    distinct from empty values.
//! 2. **Errors Are Values**: an error reply is a successful exchange, so it is
//!    carried as `Reply::Error` and only raised when the caller asks.
//! 3. **Binary-Safe**: bulk payloads and arguments are raw bytes.

use std::fmt;

use bytes::Bytes;

/// Application-level error returned by the server (`-ERR ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    message: String,
}

impl CommandError {
    /// Creates a command error carrying the server's message verbatim.
    pub fn new(message: impl Into<String>) -> Self {
        CommandError {
            message: message.into(),
        }
    }

    /// Returns the server's error text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CommandError {}

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status lines.
    Status(String),
    /// `-ERR ...` error lines.
    Error(CommandError),
    /// `:123` integers.
    Integer(i64),
    /// `$...` bulk strings, `None` for `$-1`.
    Bulk(Option<Bytes>),
    /// `*...` arrays, `None` for `*-1`. Elements may nest.
    MultiBulk(Option<Vec<Reply>>),
}

impl Reply {
    /// True for a null bulk or null multi-bulk.
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::MultiBulk(None))
    }

    /// True when the server answered with an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn as_status(&self) -> Option<&str> {
        match self {
            Reply::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Consumes the reply and returns the array elements, if any.
    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::MultiBulk(items) => items,
            _ => None,
        }
    }

    /// Raises an error reply, passing every other reply through.
    pub fn into_result(self) -> Result<Reply, CommandError> {
        match self {
            Reply::Error(err) => Err(err),
            reply => Ok(reply),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(status) => f.write_str(status),
            Reply::Error(err) => write!(f, "(error) {}", err),
            Reply::Integer(value) => write!(f, "(integer) {}", value),
            Reply::Bulk(Some(data)) => write!(f, "{:?}", String::from_utf8_lossy(data)),
            Reply::Bulk(None) | Reply::MultiBulk(None) => f.write_str("(nil)"),
            Reply::MultiBulk(Some(items)) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// One command argument.
///
/// `Multi` holds an embedded array whose elements the encoder splices into
/// the command in place. The nesting is a single level by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Single(Bytes),
    Multi(Vec<Bytes>),
}

impl Arg {
    /// Number of wire arguments this argument expands to.
    pub fn width(&self) -> usize {
        match self {
            Arg::Single(_) => 1,
            Arg::Multi(items) => items.len(),
        }
    }

    /// The byte strings this argument contributes, in order.
    pub fn parts(&self) -> &[Bytes] {
        match self {
            Arg::Single(data) => std::slice::from_ref(data),
            Arg::Multi(items) => items,
        }
    }
}

impl From<Bytes> for Arg {
    fn from(data: Bytes) -> Self {
        Arg::Single(data)
    }
}

impl From<&'static str> for Arg {
    fn from(data: &'static str) -> Self {
        Arg::Single(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(data: String) -> Self {
        Arg::Single(Bytes::from(data))
    }
}

impl From<&[u8]> for Arg {
    fn from(data: &[u8]) -> Self {
        Arg::Single(Bytes::copy_from_slice(data))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(data: &[u8; N]) -> Self {
        Arg::Single(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(data: Vec<u8>) -> Self {
        Arg::Single(Bytes::from(data))
    }
}

// Numbers go on the wire in their decimal text form.
macro_rules! decimal_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Single(Bytes::from(value.to_string()))
                }
            }
        )*
    };
}

decimal_arg!(i32, i64, u32, u64, usize, f64);

impl From<Vec<Bytes>> for Arg {
    fn from(items: Vec<Bytes>) -> Self {
        Arg::Multi(items)
    }
}

impl From<Vec<String>> for Arg {
    fn from(items: Vec<String>) -> Self {
        Arg::Multi(items.into_iter().map(Bytes::from).collect())
    }
}

impl From<Vec<&'static str>> for Arg {
    fn from(items: Vec<&'static str>) -> Self {
        Arg::Multi(
            items
                .into_iter()
                .map(|item| Bytes::from_static(item.as_bytes()))
                .collect(),
        )
    }
}

impl From<Vec<Vec<u8>>> for Arg {
    fn from(items: Vec<Vec<u8>>) -> Self {
        Arg::Multi(items.into_iter().map(Bytes::from).collect())
    }
}

/// Builds an argument list from heterogeneous values.
///
/// ```
/// use kvwire_common::{args, Arg};
/// let cmd: Vec<Arg> = args!["SET", "key", 42];
/// assert_eq!(cmd.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::Arg::from($arg)),*]
    };
}
