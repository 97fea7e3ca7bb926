//! A sending universe.
//!
//! The consumer-facing handle over the transmit scheduler: hold one per
//! universe you transmit, mutate its 512-slot buffer and let the
//! scheduler frame and emit it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::server::{StreamServer, UniverseHandle, UniverseOptions};
use super::{DEFAULT_SEND_INTERVAL, SenderError, SenderEvent};
use crate::packet::{ProtocolVersion, STARTCODE_DMX, STARTCODE_PRIORITY, validate_priority};
use crate::{
    ComponentIdentifier, DEFAULT_PORT, MAX_UNIVERSE_NUMBER, MIN_UNIVERSE_NUMBER, Slot,
    UNIVERSE_SIZE, UniverseNumber,
};

/// How a sending universe advertises priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum PriorityMode {
    /// One priority for the whole universe.
    #[default]
    PerSource,
    /// An additional stream with start code 0xDD carries a priority for
    /// every address.
    PerAddress,
}

/// Configuration for a [SentUniverse].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SenderConfig {
    /// CID for the source. All senders of one process should share it.
    pub cid: ComponentIdentifier,
    /// Name of the source.
    pub name: String,
    /// The universe number to transmit.
    pub universe: UniverseNumber,
    /// Per-source priority of the transmitted data.
    pub priority: u8,
    /// Per-source or per-address priority mode.
    pub priority_mode: PriorityMode,
    /// Which framing to transmit.
    pub version: ProtocolVersion,
    /// Unicast destination; `None` emits to the universe's multicast
    /// group. Always UDP port 5568.
    pub unicast_address: Option<IpAddr>,
    /// Keep-alive interval for idle universes.
    pub send_interval: Duration,
    /// Optional wall-clock lifetime after which the sender auto-terminates
    /// and emits [SenderEvent::TimedOut].
    pub lifetime: Option<Duration>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            cid: ComponentIdentifier::new_v4(),
            name: "New Source".to_string(),
            universe: 1,
            priority: 100,
            priority_mode: PriorityMode::default(),
            version: ProtocolVersion::default(),
            unicast_address: None,
            send_interval: DEFAULT_SEND_INTERVAL,
            lifetime: None,
        }
    }
}

/// One transmitted universe.
///
/// Created through [Engine::sender](crate::Engine::sender). Level and
/// priority mutations only take effect while sending; starting marks the
/// universe dirty so the first frame goes out on the next scheduler tick.
pub struct SentUniverse {
    server: Arc<StreamServer>,
    config: SenderConfig,
    per_address_priorities: Box<[u8; UNIVERSE_SIZE]>,
    handle: Option<UniverseHandle>,
    priority_handle: Option<UniverseHandle>,
    preview: bool,
    events: Option<crossbeam_channel::Receiver<SenderEvent>>,
}

impl SentUniverse {
    pub(crate) fn new(server: Arc<StreamServer>, config: SenderConfig) -> Result<Self, SenderError> {
        if !(MIN_UNIVERSE_NUMBER..=MAX_UNIVERSE_NUMBER).contains(&config.universe) {
            return Err(SenderError::UniverseOutOfRange(config.universe));
        }
        validate_priority(config.priority)?;

        Ok(Self {
            server,
            config,
            per_address_priorities: Box::new([0; UNIVERSE_SIZE]),
            handle: None,
            priority_handle: None,
            preview: false,
            events: None,
        })
    }

    /// Returns the [SenderConfig] for this universe.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Whether [Self::start_sending] has been called.
    pub fn is_sending(&self) -> bool {
        self.handle.is_some()
    }

    /// Event receiver for lifetime notifications; present while sending
    /// with a configured lifetime.
    pub fn events(&self) -> Option<&crossbeam_channel::Receiver<SenderEvent>> {
        self.events.as_ref()
    }

    fn destination(&self) -> Option<SocketAddr> {
        self.config.unicast_address.map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
    }

    /// Allocates the universe on the scheduler and starts transmitting.
    ///
    /// In per-address priority mode a second universe with start code 0xDD
    /// is allocated alongside; it shares the sequence counter of the data
    /// universe.
    pub fn start_sending(&mut self, preview: bool) -> Result<(), SenderError> {
        if self.is_sending() {
            return Ok(());
        }

        let (events_tx, events_rx) = match self.config.lifetime {
            Some(_) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let options = UniverseOptions {
            name: self.config.name.clone(),
            priority: self.config.priority,
            preview_data: preview,
            start_code: STARTCODE_DMX,
            version: self.config.version,
            destination: self.destination(),
            send_interval: self.config.send_interval,
            ignore_inactivity: false,
            lifetime: self.config.lifetime,
            events: events_tx,
        };
        let handle = self.server.create_universe(self.config.cid, self.config.universe, options)?;
        self.server.mark_dirty(handle)?;

        if self.config.priority_mode == PriorityMode::PerAddress {
            let options = UniverseOptions {
                name: self.config.name.clone(),
                priority: self.config.priority,
                preview_data: preview,
                start_code: STARTCODE_PRIORITY,
                version: self.config.version,
                destination: self.destination(),
                send_interval: self.config.send_interval,
                ignore_inactivity: false,
                lifetime: None,
                events: None,
            };
            let priority_handle = self
                .server
                .create_universe(self.config.cid, self.config.universe, options)
                .inspect_err(|_| {
                    self.server.destroy_universe(handle).ok();
                })?;
            self.server.set_slots(priority_handle, 0, &self.per_address_priorities[..])?;
            self.server.mark_dirty(priority_handle)?;
            self.priority_handle = Some(priority_handle);
        }

        self.handle = Some(handle);
        self.preview = preview;
        self.events = events_rx;

        log::info!("started sending universe {}", self.config.universe);
        Ok(())
    }

    /// Stops transmitting: the scheduler emits three termination frames
    /// for each allocated universe, then frees the buffers.
    pub fn stop_sending(&mut self) -> Result<(), SenderError> {
        if let Some(handle) = self.handle.take() {
            self.server.destroy_universe(handle)?;
            log::info!("stopped sending universe {}", self.config.universe);
        }
        if let Some(handle) = self.priority_handle.take() {
            self.server.destroy_universe(handle)?;
        }
        self.events = None;
        Ok(())
    }

    fn data_handle(&self) -> Result<UniverseHandle, SenderError> {
        self.handle.ok_or(SenderError::NotSending)
    }

    /// Sets one slot level and schedules a frame.
    pub fn set_level(&self, address: usize, value: Slot) -> Result<(), SenderError> {
        let handle = self.data_handle()?;
        self.server.set_slots(handle, address, &[value])?;
        self.server.mark_dirty(handle)
    }

    /// Sets an inclusive range of slots to one level.
    pub fn set_level_range(&self, start: usize, end: usize, value: Slot) -> Result<(), SenderError> {
        let handle = self.data_handle()?;
        self.server.fill_slots(handle, start, end, value)?;
        self.server.mark_dirty(handle)
    }

    /// Copies a block of levels into the buffer starting at `start_address`.
    pub fn set_levels(&self, data: &[Slot], start_address: usize) -> Result<(), SenderError> {
        let handle = self.data_handle()?;
        self.server.set_slots(handle, start_address, data)?;
        self.server.mark_dirty(handle)
    }

    /// Test pattern: one column lit in a 32x16 grid over the universe.
    pub fn set_vertical_bar(&self, index: usize, level: Slot) -> Result<(), SenderError> {
        if index >= 32 {
            return Err(SenderError::SlotRangeOutOfBounds { start: index, end: index + 1 });
        }

        let mut pattern = [0u8; UNIVERSE_SIZE];
        for row in 0..16 {
            pattern[row * 32 + index] = level;
        }
        self.set_levels(&pattern, 0)
    }

    /// Test pattern: one row lit in a 32x16 grid over the universe.
    pub fn set_horizontal_bar(&self, index: usize, level: Slot) -> Result<(), SenderError> {
        if index >= 16 {
            return Err(SenderError::SlotRangeOutOfBounds { start: index, end: index + 1 });
        }

        let mut pattern = [0u8; UNIVERSE_SIZE];
        pattern[index * 32..(index + 1) * 32].fill(level);
        self.set_levels(&pattern, 0)
    }

    /// Snapshot of the current slot buffer.
    pub fn copy_levels(&self) -> Result<[Slot; UNIVERSE_SIZE], SenderError> {
        self.server.levels(self.data_handle()?)
    }

    /// Renames the source. Applied in place while sending; the new name
    /// rides the next emitted frame.
    pub fn set_name(&mut self, name: &str) -> Result<(), SenderError> {
        if let Some(handle) = self.handle {
            self.server.set_source_name(handle, name)?;
        }
        if let Some(handle) = self.priority_handle {
            self.server.set_source_name(handle, name)?;
        }
        self.config.name = name.to_string();
        Ok(())
    }

    /// Changes the per-source priority (0-200).
    pub fn set_per_source_priority(&mut self, priority: u8) -> Result<(), SenderError> {
        validate_priority(priority)?;
        if let Some(handle) = self.handle {
            self.server.set_priority(handle, priority)?;
        }
        self.config.priority = priority;
        Ok(())
    }

    /// Replaces the per-address priority array. Takes effect immediately
    /// when sending in per-address mode, otherwise at the next start.
    pub fn set_per_channel_priorities(
        &mut self,
        priorities: &[u8; UNIVERSE_SIZE],
    ) -> Result<(), SenderError> {
        self.per_address_priorities.copy_from_slice(priorities);
        if let Some(handle) = self.priority_handle {
            self.server.set_slots(handle, 0, priorities)?;
            self.server.mark_dirty(handle)?;
        }
        Ok(())
    }

    /// Selects the priority mode. Takes effect at the next start.
    pub fn set_priority_mode(&mut self, mode: PriorityMode) {
        self.config.priority_mode = mode;
    }

    /// Selects the framing. Takes effect at the next start.
    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.config.version = version;
    }

    /// Sets or clears the unicast destination. Takes effect at the next
    /// start.
    pub fn set_unicast_address(&mut self, address: Option<IpAddr>) {
        self.config.unicast_address = address;
    }

    /// Sets the wall-clock lifetime. Takes effect at the next start.
    pub fn set_lifetime(&mut self, lifetime: Option<Duration>) {
        self.config.lifetime = lifetime;
    }

    /// Toggles the preview bit on the live stream.
    pub fn set_preview(&mut self, preview: bool) -> Result<(), SenderError> {
        if let Some(handle) = self.handle {
            self.server.set_preview_data(handle, preview)?;
        }
        if let Some(handle) = self.priority_handle {
            self.server.set_preview_data(handle, preview)?;
        }
        self.preview = preview;
        Ok(())
    }

    /// Retunes the sender to another universe, restarting the stream if it
    /// is live (the old universe receives its termination frames).
    pub fn set_universe(&mut self, universe: UniverseNumber) -> Result<(), SenderError> {
        if universe == self.config.universe {
            return Ok(());
        }
        if !(MIN_UNIVERSE_NUMBER..=MAX_UNIVERSE_NUMBER).contains(&universe) {
            return Err(SenderError::UniverseOutOfRange(universe));
        }

        if self.is_sending() {
            let preview = self.preview;
            self.stop_sending()?;
            self.config.universe = universe;
            self.start_sending(preview)?;
        } else {
            self.config.universe = universe;
        }
        Ok(())
    }

    /// Emits the current frame immediately, between scheduler ticks,
    /// without touching the dirty or timing state.
    pub fn send_now(&self) -> Result<(), SenderError> {
        self.server.send_now(self.data_handle()?)
    }
}

impl Drop for SentUniverse {
    fn drop(&mut self) {
        self.stop_sending().ok();
    }
}
