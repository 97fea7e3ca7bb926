use super::source::ObservedSource;
use crate::{ComponentIdentifier, Slot, UNIVERSE_SIZE};

/// The merge outcome for one DMX address: the authoritative level, the
/// source that won it and everyone else contending for it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[derive(serde::Serialize)]
pub struct MergedAddress {
    /// The merged level; `None` when no source transmits this address.
    pub level: Option<Slot>,
    /// CID of the source with the highest effective priority for this
    /// address.
    pub winning_source: Option<ComponentIdentifier>,
    /// CIDs of the other sources also transmitting this address.
    pub other_sources: Vec<ComponentIdentifier>,
    /// True if the level or the winner changed during the last merge.
    pub changed_since_last_merge: bool,
}

/// Whether `challenger` takes an address from `incumbent`: highest
/// effective priority wins, HTP on the level resolves equal priority, and
/// the lexicographically lowest CID is the final deterministic tiebreaker.
fn beats(challenger: &ObservedSource, incumbent: &ObservedSource, address: usize) -> bool {
    let challenger_priority = challenger.effective_priority(address);
    let incumbent_priority = incumbent.effective_priority(address);
    if challenger_priority != incumbent_priority {
        return challenger_priority > incumbent_priority;
    }

    let challenger_level = challenger.levels[address];
    let incumbent_level = incumbent.levels[address];
    if challenger_level != incumbent_level {
        return challenger_level > incumbent_level;
    }

    challenger.cid < incumbent.cid
}

/// Recomputes the merged view of a universe from its current source table.
///
/// Returns true if any address changed level or winner.
pub(crate) fn merge_universe(
    sources: &[ObservedSource],
    merged: &mut [MergedAddress; UNIVERSE_SIZE],
) -> bool {
    let mut any_changed = false;

    for (address, record) in merged.iter_mut().enumerate() {
        let mut winner: Option<&ObservedSource> = None;
        let mut others = Vec::new();

        for source in sources {
            // Sampling and preview sources are withheld; effective
            // priority zero means "do not use".
            if source.sampling || source.preview_data {
                continue;
            }
            if !source.transmits(address) || source.effective_priority(address) == 0 {
                continue;
            }

            match winner {
                None => winner = Some(source),
                Some(incumbent) => {
                    if beats(source, incumbent, address) {
                        others.push(incumbent.cid);
                        winner = Some(source);
                    } else {
                        others.push(source.cid);
                    }
                }
            }
        }

        let level = winner.map(|source| source.levels[address]);
        let winning_source = winner.map(|source| source.cid);
        others.sort_unstable();

        let changed = level != record.level || winning_source != record.winning_source;
        record.level = level;
        record.winning_source = winning_source;
        record.other_sources = others;
        record.changed_since_last_merge = changed;
        any_changed |= changed;
    }

    any_changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DataPacket, ProtocolVersion};
    use arrayvec::ArrayVec;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn source(cid: u128, priority: u8, levels: &[u8]) -> ObservedSource {
        let mut slots = ArrayVec::new();
        slots.try_extend_from_slice(levels).unwrap();
        let packet = DataPacket {
            cid: ComponentIdentifier::from_u128(cid),
            source_name: format!("source {cid:x}"),
            priority,
            synchronization_address: 0,
            sequence_number: 0,
            preview_data: false,
            stream_terminated: false,
            force_synchronization: false,
            universe: 1,
            start_code: 0x00,
            slots,
            version: ProtocolVersion::Ratified,
        };
        ObservedSource::new(&packet, IpAddr::V4(Ipv4Addr::LOCALHOST), Instant::now(), false)
    }

    fn merged() -> Box<[MergedAddress; UNIVERSE_SIZE]> {
        Box::new(std::array::from_fn(|_| MergedAddress::default()))
    }

    #[test]
    fn no_sources_means_no_level() {
        let mut view = merged();
        let changed = merge_universe(&[], &mut view);
        assert!(!changed);
        assert_eq!(view[0].level, None);
        assert_eq!(view[0].winning_source, None);
    }

    #[test]
    fn higher_priority_preempts_htp() {
        let a = source(0xa, 100, &[100]);
        let b = source(0xb, 150, &[50]);
        let mut view = merged();

        merge_universe(&[a, b], &mut view);
        assert_eq!(view[0].level, Some(50));
        assert_eq!(view[0].winning_source, Some(ComponentIdentifier::from_u128(0xb)));
        assert_eq!(view[0].other_sources, vec![ComponentIdentifier::from_u128(0xa)]);
    }

    #[test]
    fn equal_priority_resolves_by_htp() {
        let a = source(0xa, 100, &[200]);
        let b = source(0xb, 100, &[100]);
        let mut view = merged();

        merge_universe(&[a, b], &mut view);
        assert_eq!(view[0].level, Some(200));
        assert_eq!(view[0].winning_source, Some(ComponentIdentifier::from_u128(0xa)));
    }

    #[test]
    fn equal_priority_and_level_resolves_by_lowest_cid() {
        let a = source(0xa, 100, &[77]);
        let b = source(0xb, 100, &[77]);
        let mut view = merged();

        // Insertion order must not matter.
        merge_universe(&[b, a], &mut view);
        assert_eq!(view[0].winning_source, Some(ComponentIdentifier::from_u128(0xa)));
    }

    #[test]
    fn priority_zero_sources_are_ignored() {
        let a = source(0xa, 0, &[255]);
        let mut view = merged();

        merge_universe(&[a], &mut view);
        assert_eq!(view[0].level, None);
    }

    #[test]
    fn sampling_and_preview_sources_are_withheld() {
        let mut a = source(0xa, 100, &[255]);
        a.sampling = true;
        let mut b = source(0xb, 100, &[128]);
        b.preview_data = true;
        let mut view = merged();

        merge_universe(&[a, b], &mut view);
        assert_eq!(view[0].level, None);
    }

    fn priority_packet(cid: ComponentIdentifier, priorities: &[u8]) -> DataPacket {
        let mut slots = ArrayVec::new();
        slots.try_extend_from_slice(priorities).unwrap();
        DataPacket {
            cid,
            source_name: String::new(),
            priority: 100,
            synchronization_address: 0,
            sequence_number: 1,
            preview_data: false,
            stream_terminated: false,
            force_synchronization: false,
            universe: 1,
            start_code: 0xDD,
            slots,
            version: ProtocolVersion::Ratified,
        }
    }

    #[test]
    fn per_address_priority_beats_per_source() {
        let mut a = source(0xa, 100, &[10, 10]);
        a.apply_address_priorities(&priority_packet(a.cid, &[200, 0]), Instant::now());
        let b = source(0xb, 150, &[20, 20]);
        let mut view = merged();

        merge_universe(&[a, b], &mut view);
        // Address 0: A's per-address priority 200 beats B's 150.
        assert_eq!(view[0].level, Some(10));
        // Address 1: A falls back to per-source 100, B wins at 150.
        assert_eq!(view[1].level, Some(20));
    }

    #[test]
    fn changed_flags_track_level_and_winner() {
        let a = source(0xa, 100, &[100]);
        let mut view = merged();

        assert!(merge_universe(std::slice::from_ref(&a), &mut view));
        assert!(view[0].changed_since_last_merge);

        // Nothing changed on the second pass.
        assert!(!merge_universe(std::slice::from_ref(&a), &mut view));
        assert!(!view[0].changed_since_last_merge);

        // Source loss reverts the address to invalid and flags the change.
        assert!(merge_universe(&[], &mut view));
        assert!(view[0].changed_since_last_merge);
        assert_eq!(view[0].level, None);
    }

    #[test]
    fn source_loss_reverts_to_the_survivor() {
        let a = source(0xa, 100, &[100]);
        let b = source(0xb, 150, &[50]);
        let mut view = merged();

        merge_universe(&[a.clone(), b], &mut view);
        assert_eq!(view[0].level, Some(50));

        merge_universe(&[a], &mut view);
        assert_eq!(view[0].level, Some(100));
        assert_eq!(view[0].winning_source, Some(ComponentIdentifier::from_u128(0xa)));
        assert!(view[0].other_sources.is_empty());
    }
}
