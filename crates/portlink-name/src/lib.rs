//! Name resolution for portlink ports.
//!
//! Maps logical port names (`/robot/camera`) to [`Contact`]s: where and
//! how to reach an endpoint. Resolution is pluggable through the
//! [`NameSpace`] trait:
//! - [`LocalNameSpace`] — in-memory table for single-process ("local
//!   mode") operation and tests; no network traffic at all
//! - [`NameClient`] — talks to a name server over a newline-delimited
//!   JSON exchange
//! - [`MultiNameSpace`] — ordered chain of fallbacks
//!
//! Resolution is best-effort: an unknown name yields an *invalid*
//! [`Contact`], never an error. Callers treat that as "cannot reach peer
//! yet".

pub mod client;
pub mod contact;
pub mod error;
pub mod namespace;
pub mod server;

pub use client::{detect_name_server, NameClient};
pub use contact::Contact;
pub use error::{NameError, Result};
pub use namespace::{LocalNameSpace, MultiNameSpace, NameSpace};
pub use server::NameServer;
