//! Data layer for the Cap'n Web RPC protocol.
//!
//! This crate contains the pieces of the protocol that require no session
//! state and no I/O: the line-delimited JSON wire codec (expressions,
//! messages, batches), the import/export identifier space, and the error
//! taxonomy carried on the wire. The session runtime lives in the
//! `capnweb-rpc` crate.

pub mod error;
pub mod ids;
pub mod wire;

pub use crate::error::{ErrorKind, RpcError};
pub use crate::ids::{ExportId, IdAllocator, ImportId};

/// Alias for a `Result` whose error type is [`RpcError`].
pub type Result<T> = core::result::Result<T, RpcError>;
