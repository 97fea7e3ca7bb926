use super::layout::{self, Layout};
use super::{
    FORCE_SYNCHRONIZATION_BIT, PREVIEW_DATA_BIT, PacketError, ProtocolVersion,
    STREAM_TERMINATED_BIT, flags_and_length, read_source_name, validate_priority,
    validate_slot_count, validate_universe_number, write_source_name,
};
use crate::{ComponentIdentifier, Slot, UniverseNumber};

/// A preassembled E1.31 data packet for the transmit path.
///
/// The full header is written once at construction; every later emit only
/// touches the sequence number, priority, source name, options byte and
/// slot payload, so stamping a frame is a handful of byte stores.
#[derive(Debug, Clone)]
pub struct SendBuffer {
    version: ProtocolVersion,
    buf: Vec<u8>,
}

impl SendBuffer {
    /// Assembles the packet header for one sending universe.
    ///
    /// The sequence number starts at zero and the options byte clear; the
    /// slot payload is zero-initialized.
    pub fn new(
        version: ProtocolVersion,
        cid: ComponentIdentifier,
        source_name: &str,
        priority: u8,
        start_code: u8,
        universe: UniverseNumber,
        slot_count: usize,
    ) -> Result<Self, PacketError> {
        validate_priority(priority)?;
        validate_universe_number(universe)?;
        validate_slot_count(slot_count)?;

        let layout = version.layout();
        let total = layout.header_size() + slot_count;
        let mut buf = vec![0u8; total];

        buf[..layout::PREAMBLE.len()].copy_from_slice(&layout::PREAMBLE);

        // Root layer.
        let root_length = flags_and_length(total - layout::ROOT_FLAGS);
        buf[layout::ROOT_FLAGS..layout::ROOT_FLAGS + 2].copy_from_slice(&root_length.to_be_bytes());
        buf[layout::ROOT_VECTOR..layout::ROOT_VECTOR + 4].copy_from_slice(&layout.root_vector);
        buf[layout::CID..layout::CID + 16].copy_from_slice(cid.as_bytes());

        // Framing layer.
        let framing_length = flags_and_length(total - layout::FRAMING_FLAGS);
        buf[layout::FRAMING_FLAGS..layout::FRAMING_FLAGS + 2]
            .copy_from_slice(&framing_length.to_be_bytes());
        buf[layout::FRAMING_VECTOR..layout::FRAMING_VECTOR + 4]
            .copy_from_slice(&layout::FRAMING_VECTOR_VALUE);
        write_source_name(
            &mut buf[layout.source_name..layout.source_name + layout.source_name_size],
            source_name,
        )?;
        buf[layout.priority] = priority;
        buf[layout.universe..layout.universe + 2].copy_from_slice(&universe.to_be_bytes());

        // DMP layer.
        let dmp_length = flags_and_length(total - layout.dmp_flags);
        buf[layout.dmp_flags..layout.dmp_flags + 2].copy_from_slice(&dmp_length.to_be_bytes());
        buf[layout.dmp_vector()] = layout::DMP_VECTOR_VALUE;
        buf[layout.address_type()] = layout::ADDRESS_TYPE_VALUE;
        buf[layout.first_property_address()..layout.first_property_address() + 2]
            .copy_from_slice(&layout::FIRST_PROPERTY_ADDRESS_VALUE.to_be_bytes());
        buf[layout.address_increment()..layout.address_increment() + 2]
            .copy_from_slice(&layout::ADDRESS_INCREMENT_VALUE.to_be_bytes());
        let property_count = (1 + slot_count) as u16;
        buf[layout.property_count()..layout.property_count() + 2]
            .copy_from_slice(&property_count.to_be_bytes());
        buf[layout.start_code()] = start_code;

        Ok(Self { version, buf })
    }

    fn layout(&self) -> &'static Layout {
        self.version.layout()
    }

    /// Stamps the sequence number for the next emit.
    pub fn set_sequence_number(&mut self, sequence_number: u8) {
        let offset = self.layout().sequence_number;
        self.buf[offset] = sequence_number;
    }

    /// Rewrites the priority byte in place.
    pub fn set_priority(&mut self, priority: u8) -> Result<(), PacketError> {
        validate_priority(priority)?;
        let offset = self.layout().priority;
        self.buf[offset] = priority;
        Ok(())
    }

    /// Rewrites the source name field in place.
    pub fn set_source_name(&mut self, source_name: &str) -> Result<(), PacketError> {
        let layout = self.layout();
        write_source_name(
            &mut self.buf[layout.source_name..layout.source_name + layout.source_name_size],
            source_name,
        )
    }

    /// Rewrites the synchronization address. The draft framing carries none,
    /// in which case this is a no-op.
    pub fn set_synchronization_address(&mut self, address: u16) {
        if let Some(offset) = self.layout().synchronization_address {
            self.buf[offset..offset + 2].copy_from_slice(&address.to_be_bytes());
        }
    }

    fn set_option(&mut self, bit: u8, on: bool) {
        let offset = self.layout().options;
        if on {
            self.buf[offset] |= bit;
        } else {
            self.buf[offset] &= !bit;
        }
    }

    /// Sets or clears the preview data bit of the options field.
    pub fn set_preview_data(&mut self, preview: bool) {
        self.set_option(PREVIEW_DATA_BIT, preview);
    }

    /// Sets or clears the stream terminated bit of the options field.
    pub fn set_stream_terminated(&mut self, terminated: bool) {
        self.set_option(STREAM_TERMINATED_BIT, terminated);
    }

    /// Sets or clears the force synchronization bit of the options field.
    pub fn set_force_synchronization(&mut self, force: bool) {
        self.set_option(FORCE_SYNCHRONIZATION_BIT, force);
    }

    /// Returns the stream terminated bit of the options field.
    pub fn stream_terminated(&self) -> bool {
        self.buf[self.layout().options] & STREAM_TERMINATED_BIT == STREAM_TERMINATED_BIT
    }

    /// Returns the data slots (the property values after the start code).
    pub fn slots(&self) -> &[Slot] {
        &self.buf[self.layout().header_size()..]
    }

    /// Returns the data slots mutably.
    pub fn slots_mut(&mut self) -> &mut [Slot] {
        let offset = self.layout().header_size();
        &mut self.buf[offset..]
    }

    /// Returns the source name currently in the header.
    pub fn source_name(&self) -> String {
        let layout = self.layout();
        read_source_name(&self.buf[layout.source_name..layout.source_name + layout.source_name_size])
    }

    /// Returns the universe number in the header.
    pub fn universe(&self) -> UniverseNumber {
        let offset = self.layout().universe;
        u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    /// Returns the start code of the slot payload.
    pub fn start_code(&self) -> u8 {
        self.buf[self.layout().start_code()]
    }

    /// Returns the framing this buffer was assembled for.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The complete network-ordered packet, ready to emit.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::super::DataPacket;
    use super::*;
    use crate::UNIVERSE_SIZE;

    fn buffer(version: ProtocolVersion) -> SendBuffer {
        let cid = ComponentIdentifier::new_v4();
        SendBuffer::new(version, cid, "buffer test", 100, 0x00, 7, UNIVERSE_SIZE).unwrap()
    }

    #[test]
    fn ratified_buffer_has_full_packet_size() {
        assert_eq!(buffer(ProtocolVersion::Ratified).as_bytes().len(), 638);
    }

    #[test]
    fn draft_buffer_has_full_packet_size() {
        assert_eq!(buffer(ProtocolVersion::Draft).as_bytes().len(), 92 + 512);
    }

    #[test]
    fn mutations_are_visible_to_the_decoder() {
        for version in [ProtocolVersion::Draft, ProtocolVersion::Ratified] {
            let mut buffer = buffer(version);
            buffer.set_sequence_number(42);
            buffer.set_priority(150).unwrap();
            buffer.set_source_name("renamed").unwrap();
            buffer.set_stream_terminated(true);
            buffer.slots_mut()[0] = 255;

            let packet = DataPacket::decode(buffer.as_bytes()).unwrap();
            assert_eq!(packet.sequence_number, 42);
            assert_eq!(packet.priority, 150);
            assert_eq!(packet.source_name, "renamed");
            assert!(packet.stream_terminated);
            assert!(!packet.preview_data);
            assert_eq!(packet.slots[0], 255);
            assert_eq!(packet.version, version);
        }
    }

    #[test]
    fn terminated_bit_reads_back() {
        let mut buffer = buffer(ProtocolVersion::Ratified);
        assert!(!buffer.stream_terminated());
        buffer.set_stream_terminated(true);
        assert!(buffer.stream_terminated());
        buffer.set_stream_terminated(false);
        assert!(!buffer.stream_terminated());
    }

    #[test]
    fn universe_zero_is_rejected() {
        let cid = ComponentIdentifier::new_v4();
        let result = SendBuffer::new(ProtocolVersion::Ratified, cid, "x", 100, 0x00, 0, 512);
        assert!(result.is_err());
    }

    #[test]
    fn draft_name_longer_than_32_bytes_is_rejected() {
        let cid = ComponentIdentifier::new_v4();
        let name = "n".repeat(40);
        let result = SendBuffer::new(ProtocolVersion::Draft, cid, &name, 100, 0x00, 1, 512);
        assert!(result.is_err());
    }
}
