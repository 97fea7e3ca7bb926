//! The transmit scheduler.
//!
//! One worker drives a 10 ms tick across all sending universes: a
//! universe emits when it is dirty, or when it has ever been dirty and
//! either the inactivity logic still owes repeat frames or the send
//! interval expired. Termination is a counter: once a universe has
//! emitted three frames with the stream-terminated bit set, its buffer is
//! freed and the handle slot retired.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::packet::{PacketError, ProtocolVersion, STARTCODE_DMX, SendBuffer};
use crate::socket::{SocketError, TxSocket, multicast_address};
use crate::{
    ComponentIdentifier, DEFAULT_PORT, MAX_UNIVERSE_NUMBER, MIN_UNIVERSE_NUMBER, UNIVERSE_SIZE,
    UniverseNumber,
};

/// The scheduler tick shared by all sending universes.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Default keep-alive interval for idle universes.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(850);

/// E1.31: three identical frames are repeated when a universe goes idle,
/// and three terminated frames complete the termination handshake.
const MAX_INACTIVE_COUNT: u8 = 3;
const MAX_TERMINATES: u8 = 3;

/// Error type returned by the sending side.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// The universe number is outside 1..=63999 (zero in particular is
    /// rejected).
    #[error("universe number {0} is out of range")]
    UniverseOutOfRange(UniverseNumber),

    /// The handle does not address a live sending universe.
    #[error("stale or invalid sending-universe handle")]
    InvalidHandle,

    /// The operation requires [SentUniverse::start_sending](super::SentUniverse::start_sending)
    /// to have been called.
    #[error("universe is not currently sending")]
    NotSending,

    /// A slot index or range does not fit the 512-slot universe.
    #[error("slot range {start}..{end} is out of bounds")]
    SlotRangeOutOfBounds {
        /// First address of the rejected range.
        start: usize,
        /// One past the last address of the rejected range.
        end: usize,
    },

    /// A [PacketError] wrapper.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// A [SocketError] wrapper.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Out-of-band notifications for a sending universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    /// The sender's wall-clock lifetime elapsed; the termination handshake
    /// has begun.
    TimedOut,
}

/// Addresses one sending universe in the scheduler table. Slots are reused,
/// so handles carry a generation that invalidates them after retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UniverseHandle {
    index: usize,
    generation: u32,
}

/// Construction parameters for a sending universe.
pub(crate) struct UniverseOptions {
    pub name: String,
    pub priority: u8,
    pub preview_data: bool,
    pub start_code: u8,
    pub version: ProtocolVersion,
    /// Unicast destination; `None` emits to the universe's multicast group.
    pub destination: Option<SocketAddr>,
    pub send_interval: Duration,
    /// Disables the three-repeats inactivity logic, leaving only the
    /// keep-alive interval.
    pub ignore_inactivity: bool,
    /// Wall-clock lifetime after which the universe auto-terminates.
    pub lifetime: Option<Duration>,
    pub events: Option<crossbeam_channel::Sender<SenderEvent>>,
}

impl Default for UniverseOptions {
    fn default() -> Self {
        Self {
            name: "New Source".to_string(),
            priority: 100,
            preview_data: false,
            start_code: STARTCODE_DMX,
            version: ProtocolVersion::default(),
            destination: None,
            send_interval: DEFAULT_SEND_INTERVAL,
            ignore_inactivity: false,
            lifetime: None,
            events: None,
        }
    }
}

struct SendingUniverse {
    cid: ComponentIdentifier,
    number: UniverseNumber,
    buffer: SendBuffer,
    destination: SocketAddr,
    dirty: bool,
    /// True once the universe has ever been marked dirty; nothing is
    /// emitted before that.
    waited_for_dirty: bool,
    ignore_inactivity: bool,
    inactive_count: u8,
    send_interval: Duration,
    last_emit: Option<Instant>,
    num_terminates: u8,
    deadline: Option<Instant>,
    events: Option<crossbeam_channel::Sender<SenderEvent>>,
}

#[derive(Default)]
struct Entry {
    generation: u32,
    universe: Option<SendingUniverse>,
}

struct SequenceRef {
    refs: usize,
    next: u8,
}

type SequenceMap = HashMap<(ComponentIdentifier, UniverseNumber), SequenceRef>;

/// Adds a reference to the sequence counter for `(cid, universe)`,
/// creating it at zero if need be.
fn acquire_sequence(sequences: &mut SequenceMap, cid: ComponentIdentifier, universe: UniverseNumber) {
    sequences
        .entry((cid, universe))
        .and_modify(|reference| reference.refs += 1)
        .or_insert(SequenceRef { refs: 1, next: 0 });
}

/// Drops a reference to the sequence counter, freeing it with the last one.
fn release_sequence(sequences: &mut SequenceMap, cid: ComponentIdentifier, universe: UniverseNumber) {
    if let Some(reference) = sequences.get_mut(&(cid, universe)) {
        reference.refs -= 1;
        if reference.refs == 0 {
            sequences.remove(&(cid, universe));
        }
    }
}

/// Returns the next sequence number for `(cid, universe)`.
fn next_sequence(
    sequences: &mut SequenceMap,
    cid: ComponentIdentifier,
    universe: UniverseNumber,
) -> u8 {
    let reference = sequences
        .entry((cid, universe))
        .or_insert(SequenceRef { refs: 1, next: 0 });
    let sequence = reference.next;
    reference.next = sequence.wrapping_add(1);
    sequence
}

/// A universe emits on this tick iff it is dirty, or it has ever been
/// dirty and either the inactivity logic still owes repeats or the
/// keep-alive interval expired.
fn should_emit(universe: &SendingUniverse, now: Instant) -> bool {
    universe.dirty
        || (universe.waited_for_dirty
            && ((!universe.ignore_inactivity && universe.inactive_count < MAX_INACTIVE_COUNT)
                || universe
                    .last_emit
                    .is_none_or(|last| now.duration_since(last) >= universe.send_interval)))
}

struct ServerState {
    multiverse: Vec<Entry>,
    sequences: SequenceMap,
}

impl ServerState {
    fn new() -> Self {
        Self { multiverse: Vec::new(), sequences: SequenceMap::new() }
    }

    fn universe_mut(&mut self, handle: UniverseHandle) -> Result<&mut SendingUniverse, SenderError> {
        let entry = self.multiverse.get_mut(handle.index).ok_or(SenderError::InvalidHandle)?;
        if entry.generation != handle.generation {
            return Err(SenderError::InvalidHandle);
        }
        entry.universe.as_mut().ok_or(SenderError::InvalidHandle)
    }

    fn create_universe(
        &mut self,
        cid: ComponentIdentifier,
        universe: UniverseNumber,
        options: UniverseOptions,
    ) -> Result<UniverseHandle, SenderError> {
        if !(MIN_UNIVERSE_NUMBER..=MAX_UNIVERSE_NUMBER).contains(&universe) {
            return Err(SenderError::UniverseOutOfRange(universe));
        }

        let mut buffer = SendBuffer::new(
            options.version,
            cid,
            &options.name,
            options.priority,
            options.start_code,
            universe,
            UNIVERSE_SIZE,
        )?;
        buffer.set_preview_data(options.preview_data);

        let destination = options.destination.unwrap_or_else(|| {
            SocketAddr::V4(SocketAddrV4::new(multicast_address(universe), DEFAULT_PORT))
        });

        let index = match self.multiverse.iter().position(|entry| entry.universe.is_none()) {
            Some(index) => index,
            None => {
                self.multiverse.push(Entry::default());
                self.multiverse.len() - 1
            }
        };

        acquire_sequence(&mut self.sequences, cid, universe);

        let now = Instant::now();
        self.multiverse[index].universe = Some(SendingUniverse {
            cid,
            number: universe,
            buffer,
            destination,
            dirty: false,
            waited_for_dirty: false,
            ignore_inactivity: options.ignore_inactivity,
            inactive_count: 0,
            send_interval: options.send_interval,
            last_emit: None,
            num_terminates: 0,
            deadline: options.lifetime.map(|lifetime| now + lifetime),
            events: options.events,
        });

        log::debug!("created sending universe {universe} (start code {:#04x})", options.start_code);

        Ok(UniverseHandle { index, generation: self.multiverse[index].generation })
    }

    /// Begins the termination handshake. The universe is marked dirty so
    /// the three terminated frames go out on the next ticks even if it had
    /// gone fully idle.
    fn destroy_universe(&mut self, handle: UniverseHandle) -> Result<(), SenderError> {
        let universe = self.universe_mut(handle)?;
        universe.buffer.set_stream_terminated(true);
        universe.dirty = true;
        universe.waited_for_dirty = true;
        log::debug!("terminating sending universe {}", universe.number);
        Ok(())
    }

    fn mark_dirty(&mut self, handle: UniverseHandle) -> Result<(), SenderError> {
        let universe = self.universe_mut(handle)?;
        universe.dirty = true;
        universe.waited_for_dirty = true;
        Ok(())
    }

    fn set_slots(
        &mut self,
        handle: UniverseHandle,
        start: usize,
        data: &[u8],
    ) -> Result<(), SenderError> {
        let end = start + data.len();
        if end > UNIVERSE_SIZE {
            return Err(SenderError::SlotRangeOutOfBounds { start, end });
        }
        let universe = self.universe_mut(handle)?;
        universe.buffer.slots_mut()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn fill_slots(
        &mut self,
        handle: UniverseHandle,
        start: usize,
        end: usize,
        value: u8,
    ) -> Result<(), SenderError> {
        if start > end || end >= UNIVERSE_SIZE {
            return Err(SenderError::SlotRangeOutOfBounds { start, end: end + 1 });
        }
        let universe = self.universe_mut(handle)?;
        universe.buffer.slots_mut()[start..=end].fill(value);
        Ok(())
    }

    fn levels(&mut self, handle: UniverseHandle) -> Result<[u8; UNIVERSE_SIZE], SenderError> {
        let universe = self.universe_mut(handle)?;
        let mut levels = [0u8; UNIVERSE_SIZE];
        levels.copy_from_slice(universe.buffer.slots());
        Ok(levels)
    }

    fn set_source_name(&mut self, handle: UniverseHandle, name: &str) -> Result<(), SenderError> {
        let universe = self.universe_mut(handle)?;
        universe.buffer.set_source_name(name)?;
        Ok(())
    }

    fn set_priority(&mut self, handle: UniverseHandle, priority: u8) -> Result<(), SenderError> {
        let universe = self.universe_mut(handle)?;
        universe.buffer.set_priority(priority)?;
        Ok(())
    }

    fn set_preview_data(&mut self, handle: UniverseHandle, preview: bool) -> Result<(), SenderError> {
        let universe = self.universe_mut(handle)?;
        universe.buffer.set_preview_data(preview);
        Ok(())
    }

    /// Stamps and returns the current frame without touching the dirty
    /// flag, inactivity count or send-interval timer, for out-of-band
    /// emits between ticks.
    fn frame_now(&mut self, handle: UniverseHandle) -> Result<(SocketAddr, Vec<u8>), SenderError> {
        let entry = self.multiverse.get_mut(handle.index).ok_or(SenderError::InvalidHandle)?;
        if entry.generation != handle.generation {
            return Err(SenderError::InvalidHandle);
        }
        let universe = entry.universe.as_mut().ok_or(SenderError::InvalidHandle)?;

        let sequence = next_sequence(&mut self.sequences, universe.cid, universe.number);
        universe.buffer.set_sequence_number(sequence);
        Ok((universe.destination, universe.buffer.as_bytes().to_vec()))
    }

    fn universe_count(&self) -> usize {
        self.multiverse.iter().filter(|entry| entry.universe.is_some()).count()
    }

    /// One scheduler pass over every sending universe.
    fn tick(&mut self, now: Instant, emit: &mut dyn FnMut(SocketAddr, &[u8])) {
        let Self { multiverse, sequences } = self;

        for entry in multiverse.iter_mut() {
            let Some(universe) = entry.universe.as_mut() else {
                continue;
            };

            // Lifetime expiry starts the same termination handshake as an
            // explicit destroy.
            if universe.deadline.is_some_and(|deadline| now >= deadline)
                && !universe.buffer.stream_terminated()
            {
                log::info!(
                    "sending universe {} reached its lifetime, terminating",
                    universe.number
                );
                universe.buffer.set_stream_terminated(true);
                universe.dirty = true;
                universe.waited_for_dirty = true;
                if let Some(events) = &universe.events {
                    events.send(SenderEvent::TimedOut).ok();
                }
            }

            // Three terminated frames have gone out: free the buffer and
            // retire the slot.
            if universe.num_terminates >= MAX_TERMINATES {
                log::debug!("retiring sending universe {}", universe.number);
                release_sequence(sequences, universe.cid, universe.number);
                entry.universe = None;
                entry.generation = entry.generation.wrapping_add(1);
                continue;
            }

            if !should_emit(universe, now) {
                continue;
            }

            if universe.dirty {
                universe.inactive_count = 0;
            } else if universe.inactive_count < MAX_INACTIVE_COUNT {
                // The keep-alive case must not reset the inactivity count.
                universe.inactive_count += 1;
            }

            let sequence = next_sequence(sequences, universe.cid, universe.number);
            universe.buffer.set_sequence_number(sequence);
            emit(universe.destination, universe.buffer.as_bytes());

            if universe.buffer.stream_terminated() {
                universe.num_terminates += 1;
            }

            universe.dirty = false;
            universe.last_emit = Some(now);
        }
    }
}

/// The process-wide transmit engine: owns the table of sending universes,
/// the shared sequence map and the socket, and drives the tick thread.
pub(crate) struct StreamServer {
    socket: TxSocket,
    state: Mutex<ServerState>,
    stop: AtomicBool,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamServer {
    /// Binds the transmit socket on `interface` and starts the tick thread.
    pub fn start(interface: Ipv4Addr) -> Result<Arc<Self>, SenderError> {
        let socket = TxSocket::bind(interface)?;
        let server = Arc::new(Self {
            socket,
            state: Mutex::new(ServerState::new()),
            stop: AtomicBool::new(false),
            thread_handle: Mutex::new(None),
        });

        // The tick thread holds a weak reference so dropping the last
        // consumer handle stops it.
        let handle = thread::spawn({
            let server = Arc::downgrade(&server);
            move || run(server)
        });
        *server.thread_handle.lock().unwrap() = Some(handle);

        Ok(server)
    }

    /// Stops the tick thread. Live universes are not terminated; callers
    /// stop their senders first if they want clean termination frames.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.lock().unwrap().take() {
            handle.join().ok();
        }
    }

    pub fn create_universe(
        &self,
        cid: ComponentIdentifier,
        universe: UniverseNumber,
        options: UniverseOptions,
    ) -> Result<UniverseHandle, SenderError> {
        self.state.lock().unwrap().create_universe(cid, universe, options)
    }

    pub fn destroy_universe(&self, handle: UniverseHandle) -> Result<(), SenderError> {
        self.state.lock().unwrap().destroy_universe(handle)
    }

    pub fn mark_dirty(&self, handle: UniverseHandle) -> Result<(), SenderError> {
        self.state.lock().unwrap().mark_dirty(handle)
    }

    pub fn set_slots(
        &self,
        handle: UniverseHandle,
        start: usize,
        data: &[u8],
    ) -> Result<(), SenderError> {
        self.state.lock().unwrap().set_slots(handle, start, data)
    }

    pub fn fill_slots(
        &self,
        handle: UniverseHandle,
        start: usize,
        end: usize,
        value: u8,
    ) -> Result<(), SenderError> {
        self.state.lock().unwrap().fill_slots(handle, start, end, value)
    }

    pub fn levels(&self, handle: UniverseHandle) -> Result<[u8; UNIVERSE_SIZE], SenderError> {
        self.state.lock().unwrap().levels(handle)
    }

    pub fn set_source_name(&self, handle: UniverseHandle, name: &str) -> Result<(), SenderError> {
        self.state.lock().unwrap().set_source_name(handle, name)
    }

    pub fn set_priority(&self, handle: UniverseHandle, priority: u8) -> Result<(), SenderError> {
        self.state.lock().unwrap().set_priority(handle, priority)
    }

    pub fn set_preview_data(&self, handle: UniverseHandle, preview: bool) -> Result<(), SenderError> {
        self.state.lock().unwrap().set_preview_data(handle, preview)
    }

    /// Emits the universe's current frame immediately, between ticks.
    pub fn send_now(&self, handle: UniverseHandle) -> Result<(), SenderError> {
        let (destination, bytes) = self.state.lock().unwrap().frame_now(handle)?;
        if let Err(err) = self.socket.send_to(&bytes, destination) {
            log::warn!("failed to send sACN datagram to {destination}: {err}");
        }
        Ok(())
    }

    /// The number of live sending universes, including priority universes.
    pub fn universe_count(&self) -> usize {
        self.state.lock().unwrap().universe_count()
    }
}

fn run(server: Weak<StreamServer>) {
    log::debug!("transmit scheduler started");

    loop {
        let Some(server) = server.upgrade() else { break };
        if server.stop.load(Ordering::Relaxed) {
            break;
        }

        {
            let mut state = server.state.lock().unwrap();
            let socket = &server.socket;
            state.tick(Instant::now(), &mut |destination, bytes| {
                if let Err(err) = socket.send_to(bytes, destination) {
                    log::warn!("failed to send sACN datagram to {destination}: {err}");
                }
            });
        }

        drop(server);
        spin_sleep::sleep(TICK_INTERVAL);
    }

    log::debug!("transmit scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DataPacket;

    fn collect(state: &mut ServerState, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        state.tick(now, &mut |_, bytes| frames.push(bytes.to_vec()));
        frames
    }

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn nothing_is_emitted_before_the_first_dirty_mark() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        state.create_universe(cid, 1, UniverseOptions::default()).unwrap();

        let start = Instant::now();
        assert!(collect(&mut state, start).is_empty());
        assert!(collect(&mut state, at(start, 2000)).is_empty());
    }

    #[test]
    fn dirty_emit_then_three_repeats_then_keepalive() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        state.mark_dirty(handle).unwrap();

        let start = Instant::now();
        // The dirty frame plus the three inactivity repeats.
        assert_eq!(collect(&mut state, start).len(), 1);
        assert_eq!(collect(&mut state, at(start, 10)).len(), 1);
        assert_eq!(collect(&mut state, at(start, 20)).len(), 1);
        assert_eq!(collect(&mut state, at(start, 30)).len(), 1);
        // Idle until the keep-alive interval expires.
        assert!(collect(&mut state, at(start, 40)).is_empty());
        assert!(collect(&mut state, at(start, 800)).is_empty());
        assert_eq!(collect(&mut state, at(start, 881)).len(), 1);
    }

    #[test]
    fn keepalive_interval_without_inactivity_logic() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let options = UniverseOptions { ignore_inactivity: true, ..UniverseOptions::default() };
        let handle = state.create_universe(cid, 1, options).unwrap();
        state.mark_dirty(handle).unwrap();

        let start = Instant::now();
        assert_eq!(collect(&mut state, start).len(), 1);
        // No inactivity repeats.
        assert!(collect(&mut state, at(start, 10)).is_empty());
        assert!(collect(&mut state, at(start, 840)).is_empty());
        // The keep-alive still fires.
        assert_eq!(collect(&mut state, at(start, 851)).len(), 1);
    }

    #[test]
    fn sequence_numbers_are_monotone_modulo_256() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();

        let start = Instant::now();
        let mut sequences = Vec::new();
        for i in 0..300u64 {
            state.mark_dirty(handle).unwrap();
            let frames = collect(&mut state, at(start, i * 10));
            assert_eq!(frames.len(), 1);
            sequences.push(DataPacket::decode(&frames[0]).unwrap().sequence_number);
        }

        for (i, &sequence) in sequences.iter().enumerate() {
            assert_eq!(sequence, (i % 256) as u8);
        }
    }

    #[test]
    fn termination_emits_exactly_three_flagged_frames_then_retires() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        state.mark_dirty(handle).unwrap();

        let start = Instant::now();
        let first = collect(&mut state, start);
        assert!(!DataPacket::decode(&first[0]).unwrap().stream_terminated);

        state.destroy_universe(handle).unwrap();
        let mut terminated = 0;
        for i in 1..10u64 {
            for frame in collect(&mut state, at(start, i * 10)) {
                assert!(DataPacket::decode(&frame).unwrap().stream_terminated);
                terminated += 1;
            }
        }

        assert_eq!(terminated, 3);
        assert_eq!(state.universe_count(), 0);
        assert!(state.sequences.is_empty());
        // The retired handle no longer resolves.
        assert!(matches!(state.mark_dirty(handle), Err(SenderError::InvalidHandle)));
    }

    #[test]
    fn never_dirty_universe_still_terminates_promptly() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        state.destroy_universe(handle).unwrap();

        let start = Instant::now();
        let mut terminated = 0;
        for i in 0..5u64 {
            terminated += collect(&mut state, at(start, i * 10)).len();
        }
        assert_eq!(terminated, 3);
        assert_eq!(state.universe_count(), 0);
    }

    #[test]
    fn universes_sharing_a_cid_share_one_sequence_counter() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let data = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        let priority = state
            .create_universe(cid, 1, UniverseOptions {
                start_code: crate::packet::STARTCODE_PRIORITY,
                ..UniverseOptions::default()
            })
            .unwrap();

        state.mark_dirty(data).unwrap();
        state.mark_dirty(priority).unwrap();

        let frames = collect(&mut state, Instant::now());
        let sequences: Vec<u8> = frames
            .iter()
            .map(|frame| DataPacket::decode(frame).unwrap().sequence_number)
            .collect();
        assert_eq!(sequences, vec![0, 1]);

        // The counter is refcounted: it survives the first retirement and
        // is freed with the second.
        let start = Instant::now();
        state.destroy_universe(data).unwrap();
        for i in 0..5u64 {
            collect(&mut state, at(start, i * 10));
        }
        assert_eq!(state.sequences.len(), 1);

        state.destroy_universe(priority).unwrap();
        for i in 5..10u64 {
            collect(&mut state, at(start, i * 10));
        }
        assert!(state.sequences.is_empty());
    }

    #[test]
    fn lifetime_expiry_terminates_and_notifies() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let (tx, rx) = crossbeam_channel::unbounded();
        let options = UniverseOptions {
            lifetime: Some(Duration::from_secs(5)),
            events: Some(tx),
            ..UniverseOptions::default()
        };
        let handle = state.create_universe(cid, 1, options).unwrap();
        state.mark_dirty(handle).unwrap();

        let start = Instant::now();
        collect(&mut state, start);
        assert!(rx.try_recv().is_err());

        let mut terminated = 0;
        for i in 0..6u64 {
            for frame in collect(&mut state, at(start, 5000 + i * 10)) {
                if DataPacket::decode(&frame).unwrap().stream_terminated {
                    terminated += 1;
                }
            }
        }

        assert_eq!(rx.try_recv(), Ok(SenderEvent::TimedOut));
        assert_eq!(terminated, 3);
        assert_eq!(state.universe_count(), 0);
    }

    #[test]
    fn frame_now_does_not_disturb_scheduling_state() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        state.mark_dirty(handle).unwrap();

        let (_, frame) = state.frame_now(handle).unwrap();
        assert_eq!(DataPacket::decode(&frame).unwrap().sequence_number, 0);

        // The dirty flag survived, and the shared counter advanced.
        let frames = collect(&mut state, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(DataPacket::decode(&frames[0]).unwrap().sequence_number, 1);
    }

    #[test]
    fn name_and_priority_updates_ride_the_next_frame() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();
        state.set_source_name(handle, "front truss").unwrap();
        state.set_priority(handle, 42).unwrap();
        state.mark_dirty(handle).unwrap();

        let frames = collect(&mut state, Instant::now());
        let packet = DataPacket::decode(&frames[0]).unwrap();
        assert_eq!(packet.source_name, "front truss");
        assert_eq!(packet.priority, 42);
    }

    #[test]
    fn slot_writes_are_bounds_checked() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let handle = state.create_universe(cid, 1, UniverseOptions::default()).unwrap();

        assert!(state.set_slots(handle, 510, &[1, 2]).is_ok());
        assert!(matches!(
            state.set_slots(handle, 511, &[1, 2]),
            Err(SenderError::SlotRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            state.fill_slots(handle, 0, 512, 7),
            Err(SenderError::SlotRangeOutOfBounds { .. })
        ));

        state.fill_slots(handle, 0, 511, 7).unwrap();
        assert_eq!(state.levels(handle).unwrap(), [7u8; UNIVERSE_SIZE]);
    }

    #[test]
    fn universe_zero_is_rejected() {
        let mut state = ServerState::new();
        let cid = ComponentIdentifier::new_v4();
        let result = state.create_universe(cid, 0, UniverseOptions::default());
        assert!(matches!(result, Err(SenderError::UniverseOutOfRange(0))));
    }
}
