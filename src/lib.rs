//! # lichtstroom
//!
//! A bidirectional sACN (ANSI E1.31 "Streaming ACN") engine.
//!
//! The receive side listens on a universe's multicast group, tracks every
//! remote source by CID through the sampling / online / terminated / expired
//! lifecycle, and merges concurrent sources into a single authoritative
//! per-address view using per-source and per-address priorities with HTP
//! tie-breaking. The transmit side drives all sending universes from one
//! 10 ms scheduler tick: sequence stamping, keep-alives, inactivity logic
//! and the three-frame termination handshake, in both the draft and the
//! ratified E1.31 framing.
//!
//! An [Engine] owns the network interface choice, the listener registry and
//! the transmit scheduler; everything else is reached through it.

pub mod engine;
pub mod iface;
pub mod packet;
pub mod receive;
pub mod send;
pub mod socket;

pub use engine::{Engine, EngineConfig, EngineError};

/// Commonly used types for lichtstroom.
///
/// The prelude is intended to be used with `use lichtstroom::prelude::*`.
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::packet::ProtocolVersion;
    pub use crate::receive::{Listener, ListenerEvent, MergedAddress, SourceInfo};
    pub use crate::send::{PriorityMode, SenderConfig, SenderEvent, SentUniverse};
    pub use crate::{ComponentIdentifier, Slot, UniverseNumber};
}

/// # E1.31 5.6 CID (Component Identifier)
///
/// Each piece of equipment should maintain the same CID for
/// its entire lifetime (e.g. by storing it in read-only memory).
/// This means that a particular component on the network can be identified
/// as the same entity from day to day despite network
/// interruptions, power down, or other disruptions.
///
/// The choice of UUIDs for CIDs allows them to be generated as required
/// without reference to any registration process or authority.
pub type ComponentIdentifier = uuid::Uuid;

/// # E1.31 3.3 Universe Number.
///
/// Each E1.31 Data Packet contains a universe number identifying the universe
/// it carries. Valid universe numbers are within the range
/// [MIN_UNIVERSE_NUMBER]..=[MAX_UNIVERSE_NUMBER].
pub type UniverseNumber = u16;

/// # E1.31 3.4 Slot
pub type Slot = u8;

/// The default port for sACN.
pub const DEFAULT_PORT: u16 = 5568;

/// The number of data slots in a universe.
pub const UNIVERSE_SIZE: usize = 512;

/// The lowest valid universe number.
pub const MIN_UNIVERSE_NUMBER: UniverseNumber = 1;

/// The highest valid universe number.
pub const MAX_UNIVERSE_NUMBER: UniverseNumber = 63999;
