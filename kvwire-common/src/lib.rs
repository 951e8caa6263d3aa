// kvwire-common - Wire types and the RESP codec shared by kvwire drivers
//
// This crate has no sockets; drivers feed it bytes through `ReplyRead`.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod reply;

// Re-export for convenience
pub use buffer::*;
pub use codec::*;
pub use error::*;
pub use reply::*;
