//! Named ports with per-connection carrier negotiation.
//!
//! A port is a named endpoint that other ports connect to by name. Every
//! connection independently negotiates a carrier (its wire protocol)
//! through an 8-byte sniffable prologue, and may bootstrap off the
//! initial TCP stream onto a better transport mid-handshake; the `local`
//! carrier does this to move same-process traffic onto a direct pipe.
//!
//! ```no_run
//! use std::sync::Arc;
//! use portlink::{Bundle, CarrierRegistry, InputPort, LocalNameSpace, OutputPort, PortConfig};
//!
//! # fn main() -> portlink::Result<()> {
//! let registry = CarrierRegistry::with_defaults();
//! let names = Arc::new(LocalNameSpace::new());
//!
//! let input: InputPort<Bundle> = InputPort::open(
//!     "/sum",
//!     PortConfig::default(),
//!     Arc::clone(&registry),
//!     names.clone(),
//! )?;
//!
//! let mut output = OutputPort::open("/numbers", PortConfig::default(), registry, names)?;
//! output.add_output("/sum", None)?;
//!
//! let mut msg = Bundle::new();
//! msg.push_int(1).push_float(2.5).push_text("hi");
//! output.write(&msg)?;
//!
//! let received = input.read(true);
//! # let _ = received;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod face;
pub mod input;
pub mod logging;
pub mod message;
pub mod output;

pub use config::PortConfig;
pub use error::{PortError, Result};
pub use face::Face;
pub use input::InputPort;
pub use logging::{init_logging, LogFormat, LogLevel};
pub use message::{Bundle, Portable, RecordedMessage, Value};
pub use output::{ConnectionInfo, OutputPort};

pub use portlink_carrier::{
    Carrier, CarrierError, CarrierRegistry, Phase, Protocol, Route, WireReader, WireWriter,
};
pub use portlink_name::{
    detect_name_server, Contact, LocalNameSpace, MultiNameSpace, NameClient, NameServer,
    NameSpace,
};
pub use portlink_transport::{StreamAddr, TwoWayStream};
