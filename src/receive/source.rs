use std::net::IpAddr;
use std::time::Instant;

use super::SOURCE_LOSS_TIMEOUT;
use crate::packet::{DataPacket, ProtocolVersion};
use crate::{ComponentIdentifier, Slot, UNIVERSE_SIZE, UniverseNumber};

/// A snapshot of one observed source, safe to hand to consumer threads.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SourceInfo {
    /// CID of the source.
    pub cid: ComponentIdentifier,
    /// User assigned name of the source.
    pub name: String,
    /// Address the source's packets arrive from.
    pub ip: IpAddr,
    /// The universe this source was observed on.
    pub universe: UniverseNumber,
    /// Current per-source priority.
    pub priority: u8,
    /// Last accepted sequence number.
    pub sequence_number: u8,
    /// Whether the source marks its data as preview-only.
    pub preview_data: bool,
    /// Whether the source requests forced synchronization. Parsed but not
    /// acted upon.
    pub force_synchronization: bool,
    /// Whether the source was observed during the listener's sampling
    /// window and is still withheld from the merge.
    pub sampling: bool,
    /// Whether the source currently transmits per-address priorities
    /// (start code 0xDD).
    pub per_address_priority: bool,
    /// Which framing the source transmits.
    pub version: ProtocolVersion,
}

/// The listener-private record of a remote source, keyed by CID.
///
/// Mutated by the listener worker only. A source is in exactly one of
/// {sampling, online, terminated, expired}: terminated and expired sources
/// are removed from the table, sampling is a flag on the record, and
/// everything else in the table is online.
#[derive(Clone)]
pub(crate) struct ObservedSource {
    pub cid: ComponentIdentifier,
    pub name: String,
    pub ip: IpAddr,
    pub universe: UniverseNumber,
    pub priority: u8,
    pub sequence_number: u8,
    pub last_seen: Instant,
    /// Hold-last-look: levels persist between packets until the source
    /// expires.
    pub levels: [Slot; UNIVERSE_SIZE],
    /// How many slots the source actually transmits.
    pub slot_count: usize,
    pub address_priorities: Option<Box<[u8; UNIVERSE_SIZE]>>,
    pub address_priorities_updated: Option<Instant>,
    pub preview_data: bool,
    pub force_synchronization: bool,
    pub sampling: bool,
    pub version: ProtocolVersion,
}

impl ObservedSource {
    pub fn new(packet: &DataPacket, ip: IpAddr, now: Instant, sampling: bool) -> Self {
        let mut source = Self {
            cid: packet.cid,
            name: packet.source_name.clone(),
            ip,
            universe: packet.universe,
            priority: packet.priority,
            sequence_number: packet.sequence_number,
            last_seen: now,
            levels: [0; UNIVERSE_SIZE],
            slot_count: 0,
            address_priorities: None,
            address_priorities_updated: None,
            preview_data: packet.preview_data,
            force_synchronization: packet.force_synchronization,
            sampling,
            version: packet.version,
        };

        match packet.start_code {
            crate::packet::STARTCODE_DMX => source.apply_levels(packet),
            crate::packet::STARTCODE_PRIORITY => source.apply_address_priorities(packet, now),
            _ => {}
        }

        source
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            cid: self.cid,
            name: self.name.clone(),
            ip: self.ip,
            universe: self.universe,
            priority: self.priority,
            sequence_number: self.sequence_number,
            preview_data: self.preview_data,
            force_synchronization: self.force_synchronization,
            sampling: self.sampling,
            per_address_priority: self.address_priorities.is_some(),
            version: self.version,
        }
    }

    pub fn apply_levels(&mut self, packet: &DataPacket) {
        self.slot_count = packet.slots.len().min(UNIVERSE_SIZE);
        self.levels[..self.slot_count].copy_from_slice(&packet.slots[..self.slot_count]);
    }

    pub fn apply_address_priorities(&mut self, packet: &DataPacket, now: Instant) {
        let priorities = self
            .address_priorities
            .get_or_insert_with(|| Box::new([0; UNIVERSE_SIZE]));
        priorities.fill(0);
        let count = packet.slots.len().min(UNIVERSE_SIZE);
        priorities[..count].copy_from_slice(&packet.slots[..count]);
        self.address_priorities_updated = Some(now);
    }

    /// Drops stale per-address priorities, reverting every address to the
    /// per-source priority.
    pub fn age_address_priorities(&mut self, now: Instant) {
        if let Some(updated) = self.address_priorities_updated {
            if now.duration_since(updated) >= SOURCE_LOSS_TIMEOUT {
                log::trace!("per-address priorities of source {} went stale", self.cid);
                self.address_priorities = None;
                self.address_priorities_updated = None;
            }
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) >= SOURCE_LOSS_TIMEOUT
    }

    /// Whether this source transmits the given address at all.
    pub fn transmits(&self, address: usize) -> bool {
        address < self.slot_count
    }

    /// The priority contending for one address: the per-address priority
    /// when one is present and non-zero, the per-source priority otherwise.
    /// Zero means "do not use".
    pub fn effective_priority(&self, address: usize) -> u8 {
        match &self.address_priorities {
            Some(priorities) if priorities[address] > 0 => priorities[address],
            _ => self.priority,
        }
    }
}

/// E1.31 6.7.2 sequence numbering: a packet is accepted when the wrapped
/// distance to the last accepted sequence number is within [1, 127];
/// everything else is out of order and discarded.
pub(crate) fn sequence_valid(last: u8, next: u8) -> bool {
    let distance = next.wrapping_sub(last);
    (1..=127).contains(&distance)
}
