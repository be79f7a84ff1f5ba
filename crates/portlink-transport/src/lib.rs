//! Bidirectional byte-stream abstraction for portlink.
//!
//! Provides a unified interface over the byte transports a connection can
//! run on:
//! - TCP sockets (the generic initial transport for every connection)
//! - In-process pipe pairs (the bootstrap target of the `local` carrier)
//! - A null stream used as a safe default before a real stream is attached
//!
//! This is the lowest layer of portlink. Everything else builds on top of
//! the [`TwoWayStream`] trait provided here.

pub mod addr;
pub mod error;
pub mod pipe;
pub mod stream;
pub mod tcp;

pub use addr::StreamAddr;
pub use error::{Result, TransportError};
pub use pipe::{pipe_pair, PipeStream};
pub use stream::{NullStream, StreamInterrupter, TwoWayStream};
pub use tcp::{TcpTransport, TcpTwoWayStream};
