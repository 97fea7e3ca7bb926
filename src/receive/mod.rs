//! # Receiving
//!
//! One [Listener] per universe: it owns the receive sockets, tracks every
//! remote source through the sampling / online / terminated / expired
//! lifecycle and merges all contributing sources into a single
//! per-address view. The [ListenerRegistry] de-duplicates listeners by
//! universe and cross-dispatches unicast datagrams that arrive on the
//! wrong listener's socket.

use std::time::Duration;

mod listener;
mod merge;
mod registry;
mod source;

pub use listener::{Listener, ListenerDiagnostics, ListenerError, ListenerEvent};
pub use merge::MergedAddress;
pub use registry::ListenerRegistry;
pub use source::SourceInfo;

/// E1.31 6.7.1: a source is lost when no packet arrives for this long.
/// Per-address priorities also revert to the per-source priority when the
/// last 0xDD packet is older than this window.
pub const SOURCE_LOSS_TIMEOUT: Duration = Duration::from_millis(2500);

/// The initial sampling window after a listener starts. Sources observed
/// during this window are withheld from the merge so stale ghosts from
/// recently restarted peers do not leak into the output.
pub const SAMPLING_INTERVAL: Duration = Duration::from_millis(1500);

/// Merge cadence, matching the maximum E1.31 source rate of ~44 Hz.
pub(crate) const MERGE_INTERVAL: Duration = Duration::from_millis(23);
