//! Carrier negotiation and connection lifecycle engine.
//!
//! This is the core of portlink: the handshake state machine that lets two
//! endpoints agree on a wire protocol ("carrier") per connection, bootstrap
//! into an optimized transport mid-handshake, and then stream messages with
//! per-carrier framing and acknowledgement discipline.
//!
//! - [`Carrier`] — strategy object for one wire protocol's capabilities and
//!   handshake steps; cloned from a registered prototype per connection
//! - [`CarrierRegistry`] — maps a carrier name or a sniffed 8-byte header
//!   to a prototype to clone
//! - [`Protocol`] — owns a single connection: one live stream, one
//!   [`Route`], and the negotiated carrier driving it
//! - [`WireReader`]/[`WireWriter`] — the byte-level payload boundary
//!   exposed to envelope code

pub mod carrier;
pub mod carriers;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod state;
pub mod wire;

pub use carrier::Carrier;
pub use carriers::local::{LocalCarrier, PipeRendezvous};
pub use carriers::tcp::TcpCarrier;
pub use carriers::text::TextCarrier;
pub use error::{CarrierError, Result};
pub use protocol::{Phase, Protocol};
pub use registry::CarrierRegistry;
pub use route::Route;
pub use state::{ConnectionState, ShiftStream};
pub use wire::{BufferWireWriter, SizedData, StreamWireReader, WireReader, WireWriter};
