//! Multi-client TCP message relay.
//!
//! Every message one peer sends is rebroadcast to every other connected peer. All connections
//! share one live registry, so a peer that joins late still hears from everyone who joined
//! before it. Each module owns one piece of the relay path:
//!
//! - [`relay`] binds the listening socket, registers each accepted connection and spawns a
//!   worker for it; it also publishes [`relay::RelayEvent`]s.
//! - [`registry`] tracks connected peers behind a lock shared by every task.
//! - [`worker`] runs one connection: reads frames, spots the `.` disconnect sentinel, hands
//!   messages to the router and removes the peer when it leaves.
//! - [`router`] fans a message out to every peer except its sender.
//! - [`codec`] frames messages on the wire (length-prefixed, lines, or legacy raw reads).
//! - [`config`] and [`cli`] assemble the settings from a TOML file and command-line flags.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod router;
pub mod worker;

pub use config::{Framing, RelayConfig};
pub use relay::{Relay, RelayEvent};
