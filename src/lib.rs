//! USB redirection protocol core in pure Rust.
//!
//! This crate tunnels the interaction with a single USB device across a
//! reliable, ordered byte stream. It provides:
//!
//! * [`Parser`] — the protocol codec: framing, capability negotiation,
//!   typed packet dispatch through [`PacketHandler`], an outbound write
//!   queue, and mid-stream state [serialization](Parser::serialize) for
//!   connection handoff.
//! * [`Host`] — the device-side engine: owns a device through a
//!   [`UsbBackend`](backend::UsbBackend) implementation and maps guest
//!   commands onto native transfers, including stream lifecycles, stall
//!   recovery, isochronous back-pressure and disconnect sequencing.
//! * [`filter`] — device allow/deny rules shared by both sides.
//!
//! The guest side uses [`Parser`] directly with its own `PacketHandler`.
//! Byte transport and the native USB event loop stay outside the crate:
//! the application feeds bytes via [`Parser::do_read`] / `do_write` (or
//! the `Host` wrappers) and delivers transfer completions to
//! [`Host::handle_completion`].

pub mod backend;
mod caps;
pub mod descriptors;
pub mod filter;
mod host;
mod parser;
pub mod proto;
mod serialize;

pub use caps::{Cap, CapSet, CAPS_WORDS};
pub use host::{
    check_device_filter, DeviceFilterError, Host, HostFlags, HostReadError, OpenError,
};
pub use parser::{PacketHandler, Parser, ParserFlags, ReadError, Transport, WriteError};
pub use proto::{EpType, PacketType, Speed, Status};
pub use serialize::{UnserializeError, SERIALIZE_MAGIC};
