//! # Sending
//!
//! A [SentUniverse] is the consumer handle for one transmitted universe:
//! a 512-slot buffer, priority and name setters, test patterns and the
//! start/stop lifecycle. All live universes are driven by one
//! [StreamServer](server::StreamServer) scheduler tick every 10 ms, which
//! stamps sequence numbers from the shared per-(CID, universe) counter,
//! applies the E1.31 inactivity and keep-alive rules and runs the
//! three-frame termination handshake.

mod server;
mod universe;

pub(crate) use server::StreamServer;
pub use server::{DEFAULT_SEND_INTERVAL, SenderError, SenderEvent};
pub use universe::{PriorityMode, SenderConfig, SentUniverse};
