//! A room-based chat relay: a registry of connected participants and named
//! rooms, a per-connection session state machine, and a broadcaster that
//! fans chat out to room members over websockets.

pub mod broadcaster;
pub mod client;
pub mod config;
pub mod connector;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;

pub use envelope::{Envelope, Kind};
pub use registry::Registry;
pub use server::Server;
