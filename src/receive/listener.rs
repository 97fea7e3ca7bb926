//! An sACN Listener.
//!
//! One listener per universe. The listener owns its receive sockets and a
//! worker thread on which all socket reads, source-table updates and
//! merges run; consumers read published snapshots and subscribe to events.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::merge::{MergedAddress, merge_universe};
use super::registry::ListenerRegistry;
use super::source::{ObservedSource, SourceInfo, sequence_valid};
use super::{MERGE_INTERVAL, SAMPLING_INTERVAL};
use crate::packet::{DataPacket, PacketError, STARTCODE_DMX, STARTCODE_PRIORITY};
use crate::socket::{MAX_DATAGRAM_SIZE, RxSocket, SocketError};
use crate::{MAX_UNIVERSE_NUMBER, MIN_UNIVERSE_NUMBER, Slot, UNIVERSE_SIZE, UniverseNumber};

/// How long the worker sleeps when no datagram is waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Backoff schedule for reopening a failed receive socket.
const REOPEN_BACKOFF: [Duration; 3] =
    [Duration::from_millis(100), Duration::from_millis(500), Duration::from_secs(2)];

/// Error type returned by a [Listener].
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The universe number is outside 1..=63999.
    #[error("universe number {0} is out of range")]
    UniverseOutOfRange(UniverseNumber),

    /// The DMX address is outside 0..512.
    #[error("address {0} is out of range")]
    AddressOutOfRange(usize),

    /// A [SocketError] wrapper.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Events emitted by a [Listener]. Obtain a receiver with
/// [Listener::subscribe].
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A new source appeared on the universe.
    SourceFound(SourceInfo),
    /// A source terminated its stream or expired.
    SourceLost(SourceInfo),
    /// A source changed its name or priority.
    SourceChanged(SourceInfo),
    /// At least one merged level or winner changed during the last merge.
    LevelsChanged,
    /// A reading for a monitored address, produced on every merge.
    DataReady {
        /// The monitored DMX address.
        address: usize,
        /// The merged level.
        level: Slot,
        /// Time since the listener started.
        elapsed: Duration,
    },
}

/// Counters for datagrams the listener dropped, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize)]
pub struct ListenerDiagnostics {
    /// Datagrams that failed validation.
    pub malformed_packets: u64,
    /// Datagrams in neither the draft nor the ratified framing.
    pub unsupported_versions: u64,
    /// Datagrams for another universe (offered to sibling listeners).
    pub wrong_universe_packets: u64,
    /// Packets discarded by the sequence-number window.
    pub out_of_order_packets: u64,
}

/// An sACN listener for one universe.
///
/// Listeners should not be constructed directly; use
/// [ListenerRegistry::get] so that consumers of the same universe share
/// one listener.
pub struct Listener {
    inner: Arc<Inner>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Binds the universe's sockets and starts the worker thread.
    pub(crate) fn start(
        universe: UniverseNumber,
        interface: Ipv4Addr,
        registry: Weak<ListenerRegistry>,
    ) -> Result<Self, ListenerError> {
        if !(MIN_UNIVERSE_NUMBER..=MAX_UNIVERSE_NUMBER).contains(&universe) {
            return Err(ListenerError::UniverseOutOfRange(universe));
        }

        let sockets = open_sockets(universe, interface)?;
        let inner = Arc::new(Inner::new(universe, interface, registry));

        let thread_handle = thread::spawn({
            let inner = Arc::clone(&inner);
            move || run(inner, sockets)
        });

        Ok(Self { inner, thread_handle: Mutex::new(Some(thread_handle)) })
    }

    /// The universe this listener is listening for.
    pub fn universe(&self) -> UniverseNumber {
        self.inner.universe
    }

    /// Whether the listener is still inside its initial sampling window.
    pub fn is_sampling(&self) -> bool {
        self.inner.state.lock().unwrap().sampling
    }

    /// A snapshot of the merged view of the universe, one record per DMX
    /// address.
    pub fn merged_levels(&self) -> Vec<MergedAddress> {
        self.inner.state.lock().unwrap().merged.to_vec()
    }

    /// The number of currently observed sources.
    pub fn source_count(&self) -> usize {
        self.inner.state.lock().unwrap().sources.len()
    }

    /// A snapshot of the observed source at `index`, in discovery order.
    pub fn source(&self, index: usize) -> Option<SourceInfo> {
        self.inner.state.lock().unwrap().sources.get(index).map(ObservedSource::info)
    }

    /// Snapshots of all observed sources, in discovery order.
    pub fn sources(&self) -> Vec<SourceInfo> {
        self.inner.state.lock().unwrap().sources.iter().map(ObservedSource::info).collect()
    }

    /// Starts emitting [ListenerEvent::DataReady] for a DMX address on
    /// every merge.
    pub fn monitor_address(&self, address: usize) -> Result<(), ListenerError> {
        if address >= UNIVERSE_SIZE {
            return Err(ListenerError::AddressOutOfRange(address));
        }
        self.inner.monitored.lock().unwrap().insert(address);
        Ok(())
    }

    /// Stops monitoring a DMX address.
    pub fn unmonitor_address(&self, address: usize) -> Result<(), ListenerError> {
        if address >= UNIVERSE_SIZE {
            return Err(ListenerError::AddressOutOfRange(address));
        }
        self.inner.monitored.lock().unwrap().remove(&address);
        Ok(())
    }

    /// Subscribes to this listener's events.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<ListenerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Diagnostic: completed merges over the last second.
    pub fn merges_per_second(&self) -> u32 {
        self.inner.merges_per_second.load(Ordering::Relaxed)
    }

    /// Counters for dropped datagrams.
    pub fn diagnostics(&self) -> ListenerDiagnostics {
        *self.inner.diagnostics.lock().unwrap()
    }

    /// Processes a suspected sACN datagram.
    ///
    /// This is the public entry that allows other listeners (or a
    /// consumer's own transport) to pass on unicast datagrams for this
    /// universe that arrived on a different socket.
    pub fn process_datagram(&self, data: &[u8], receiver: SocketAddr, sender: SocketAddr) {
        self.inner.handle_datagram(data, receiver, sender, false);
    }

    /// Registry-internal forwarding entry; never re-forwards.
    pub(crate) fn forward_datagram(&self, data: &[u8], receiver: SocketAddr, sender: SocketAddr) {
        self.inner.handle_datagram(data, receiver, sender, true);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

fn open_sockets(
    universe: UniverseNumber,
    interface: Ipv4Addr,
) -> Result<Vec<RxSocket>, SocketError> {
    let multicast = RxSocket::multicast(universe, interface)?;
    let mut sockets = vec![multicast];

    // Non-fatal: the multicast socket is the primary feed, the unicast
    // socket only adds unicast-delivered sACN.
    match RxSocket::unicast(interface) {
        Ok(unicast) => sockets.push(unicast),
        Err(err) => log::warn!("failed to bind unicast receive socket on {interface}: {err}"),
    }

    Ok(sockets)
}

/// The worker loop: drain sockets, run the timing state machine, merge.
fn run(inner: Arc<Inner>, mut sockets: Vec<RxSocket>) {
    log::debug!("listener for universe {} started", inner.universe);

    let mut data = Vec::with_capacity(MAX_DATAGRAM_SIZE);
    let mut sample_deadline = Some(inner.started + SAMPLING_INTERVAL);
    let mut next_merge = inner.started + MERGE_INTERVAL;
    let mut backoff = 0usize;

    while !inner.stop.load(Ordering::Relaxed) {
        let mut received_any = false;
        let mut socket_failed = false;

        for socket in &sockets {
            loop {
                match socket.recv_from(&mut data) {
                    Ok(Some(sender)) => {
                        received_any = true;
                        inner.handle_datagram(&data, socket.local_addr(), sender, false);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::warn!("receive error on universe {}: {err}", inner.universe);
                        socket_failed = true;
                        break;
                    }
                }
            }
        }

        if socket_failed {
            sockets.clear();
            let delay = REOPEN_BACKOFF[backoff];
            backoff = (backoff + 1).min(REOPEN_BACKOFF.len() - 1);
            spin_sleep::sleep(delay);

            match open_sockets(inner.universe, inner.interface) {
                Ok(reopened) => {
                    log::info!("reopened receive sockets for universe {}", inner.universe);
                    sockets = reopened;
                    backoff = 0;
                }
                Err(err) => {
                    log::error!(
                        "failed to reopen receive sockets for universe {}: {err}",
                        inner.universe
                    );
                }
            }
            continue;
        }

        let now = Instant::now();

        if sample_deadline.is_some_and(|deadline| now >= deadline) {
            sample_deadline = None;
            inner.end_sampling();
        }

        inner.expire_sources(now);

        if now >= next_merge || inner.merge_pending() {
            inner.perform_merge(now);
            next_merge = now + MERGE_INTERVAL;
        }

        if !received_any {
            spin_sleep::sleep(POLL_INTERVAL);
        }
    }

    log::debug!("listener for universe {} stopped", inner.universe);
}

struct State {
    sources: Vec<ObservedSource>,
    merged: Box<[MergedAddress; UNIVERSE_SIZE]>,
    sampling: bool,
    /// Set when the source set changed, forcing a merge before the next
    /// cadence tick.
    merge_pending: bool,
    merge_count: u32,
    merge_window_start: Instant,
}

impl State {
    fn new(now: Instant) -> Self {
        Self {
            sources: Vec::new(),
            merged: Box::new(std::array::from_fn(|_| MergedAddress::default())),
            sampling: true,
            merge_pending: false,
            merge_count: 0,
            merge_window_start: now,
        }
    }
}

struct Inner {
    universe: UniverseNumber,
    interface: Ipv4Addr,
    started: Instant,
    stop: AtomicBool,
    state: Mutex<State>,
    monitored: Mutex<HashSet<usize>>,
    subscribers: Mutex<Vec<crossbeam_channel::Sender<ListenerEvent>>>,
    merges_per_second: AtomicU32,
    diagnostics: Mutex<ListenerDiagnostics>,
    registry: Weak<ListenerRegistry>,
}

impl Inner {
    fn new(
        universe: UniverseNumber,
        interface: Ipv4Addr,
        registry: Weak<ListenerRegistry>,
    ) -> Self {
        let started = Instant::now();
        Self {
            universe,
            interface,
            started,
            stop: AtomicBool::new(false),
            state: Mutex::new(State::new(started)),
            monitored: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            merges_per_second: AtomicU32::new(0),
            diagnostics: Mutex::new(ListenerDiagnostics::default()),
            registry,
        }
    }

    fn emit(&self, event: ListenerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn merge_pending(&self) -> bool {
        self.state.lock().unwrap().merge_pending
    }

    fn handle_datagram(&self, data: &[u8], receiver: SocketAddr, sender: SocketAddr, forwarded: bool) {
        let packet = match DataPacket::decode(data) {
            Ok(packet) => packet,
            Err(PacketError::UnsupportedVersion(vector)) => {
                log::trace!("dropping packet with unsupported root vector {vector:02x?} from {sender}");
                self.diagnostics.lock().unwrap().unsupported_versions += 1;
                return;
            }
            Err(err) => {
                log::trace!("dropping malformed packet from {sender}: {err}");
                self.diagnostics.lock().unwrap().malformed_packets += 1;
                return;
            }
        };

        if packet.universe != self.universe {
            self.diagnostics.lock().unwrap().wrong_universe_packets += 1;
            // Unicast datagrams for other universes legitimately arrive on
            // this listener's socket; offer them to the listener that owns
            // the universe.
            if !forwarded {
                if let Some(registry) = self.registry.upgrade() {
                    log::trace!(
                        "forwarding universe {} datagram received on {receiver}",
                        packet.universe
                    );
                    registry.dispatch(packet.universe, data, receiver, sender);
                }
            }
            return;
        }

        self.update_source_table(packet, sender.ip(), Instant::now());
    }

    fn update_source_table(&self, packet: DataPacket, sender: IpAddr, now: Instant) {
        let mut state = self.state.lock().unwrap();

        let Some(index) = state.sources.iter().position(|source| source.cid == packet.cid) else {
            // A termination for a source we never tracked carries nothing.
            if packet.stream_terminated {
                return;
            }

            let source = ObservedSource::new(&packet, sender, now, state.sampling);
            let info = source.info();
            state.sources.push(source);
            state.merge_pending = true;
            drop(state);

            log::debug!(
                "found source \"{}\" ({}) on universe {}",
                info.name,
                info.cid,
                self.universe
            );
            self.emit(ListenerEvent::SourceFound(info));
            return;
        };

        let source = &mut state.sources[index];
        if !sequence_valid(source.sequence_number, packet.sequence_number) {
            log::trace!(
                "discarding out-of-order packet from {} (last {}, got {})",
                packet.cid,
                source.sequence_number,
                packet.sequence_number
            );
            drop(state);
            self.diagnostics.lock().unwrap().out_of_order_packets += 1;
            return;
        }
        source.sequence_number = packet.sequence_number;

        if packet.stream_terminated {
            let info = source.info();
            state.sources.remove(index);
            state.merge_pending = true;
            drop(state);

            log::debug!("source \"{}\" ({}) terminated its stream", info.name, info.cid);
            self.emit(ListenerEvent::SourceLost(info));
            return;
        }

        source.last_seen = now;

        match packet.start_code {
            STARTCODE_DMX => {
                let mut changed = false;
                if source.name != packet.source_name {
                    source.name = packet.source_name.clone();
                    changed = true;
                }
                if source.priority != packet.priority {
                    source.priority = packet.priority;
                    changed = true;
                }
                source.preview_data = packet.preview_data;
                source.force_synchronization = packet.force_synchronization;
                source.version = packet.version;
                source.apply_levels(&packet);

                let info = changed.then(|| source.info());
                drop(state);
                if let Some(info) = info {
                    self.emit(ListenerEvent::SourceChanged(info));
                }
            }
            STARTCODE_PRIORITY => {
                source.apply_address_priorities(&packet, now);
            }
            other => {
                // E1.31: alternate start codes are ignored.
                log::trace!("ignoring start code {other:#04x} from source {}", packet.cid);
            }
        }
    }

    /// Ends the initial sampling window: sources observed so far go live.
    fn end_sampling(&self) {
        let mut state = self.state.lock().unwrap();
        state.sampling = false;
        for source in &mut state.sources {
            source.sampling = false;
        }
        state.merge_pending = true;
        drop(state);

        log::debug!("sampling window for universe {} ended", self.universe);
    }

    /// Removes sources that went silent for the source-loss window and
    /// ages per-address priorities.
    fn expire_sources(&self, now: Instant) {
        let mut lost = Vec::new();

        let mut state = self.state.lock().unwrap();
        state.sources.retain(|source| {
            if source.is_expired(now) {
                lost.push(source.info());
                false
            } else {
                true
            }
        });
        for source in &mut state.sources {
            source.age_address_priorities(now);
        }
        if !lost.is_empty() {
            state.merge_pending = true;
        }
        drop(state);

        for info in lost {
            log::debug!("lost source \"{}\" ({}) on universe {}", info.name, info.cid, self.universe);
            self.emit(ListenerEvent::SourceLost(info));
        }
    }

    fn perform_merge(&self, now: Instant) {
        let monitored: Vec<usize> = {
            let monitored = self.monitored.lock().unwrap();
            monitored.iter().copied().collect()
        };

        let mut readings = Vec::new();
        let changed;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            changed = merge_universe(&state.sources, &mut state.merged);
            state.merge_pending = false;

            for &address in &monitored {
                if let Some(level) = state.merged[address].level {
                    readings.push((address, level));
                }
            }

            state.merge_count += 1;
            if now.duration_since(state.merge_window_start) >= Duration::from_secs(1) {
                self.merges_per_second.store(state.merge_count, Ordering::Relaxed);
                state.merge_count = 0;
                state.merge_window_start = now;
            }
        }

        if changed {
            self.emit(ListenerEvent::LevelsChanged);
        }

        let elapsed = now.duration_since(self.started);
        for (address, level) in readings {
            self.emit(ListenerEvent::DataReady { address, level, elapsed });
        }
    }
}
