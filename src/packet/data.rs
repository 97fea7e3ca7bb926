use arrayvec::ArrayVec;

use super::layout;
use super::{
    FORCE_SYNCHRONIZATION_BIT, PREVIEW_DATA_BIT, PacketError, ProtocolVersion, STREAM_TERMINATED_BIT,
    SendBuffer, read_source_name, validate_priority, validate_universe_number,
};
use crate::{ComponentIdentifier, Slot, UNIVERSE_SIZE, UniverseNumber};

/// A fully decoded E1.31 data packet, in either framing.
///
/// This is the typed inverse of [SendBuffer]: fields can be asserted by
/// name instead of by byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// CID of the sending component.
    pub cid: ComponentIdentifier,
    /// User assigned name of the source.
    pub source_name: String,
    /// Data priority if multiple sources.
    pub priority: u8,
    /// Universe address on which sync packets will be sent. Always zero for
    /// the draft framing, which carries no such field.
    pub synchronization_address: u16,
    /// Sequence number.
    pub sequence_number: u8,
    /// E1.31 6.2.6: preview data bit. Data intended for visualization only.
    pub preview_data: bool,
    /// E1.31 6.2.6: stream terminated bit.
    pub stream_terminated: bool,
    /// E1.31 6.2.6: force synchronization bit. Parsed and surfaced, but
    /// synchronization universes are not implemented.
    pub force_synchronization: bool,
    /// Universe number.
    pub universe: UniverseNumber,
    /// First property value: the DMX512-A start code.
    pub start_code: u8,
    /// The data slots after the start code.
    pub slots: ArrayVec<Slot, UNIVERSE_SIZE>,
    /// Which framing the packet used on the wire.
    pub version: ProtocolVersion,
}

impl DataPacket {
    /// Decodes a network ordered slice of bytes into a new [DataPacket].
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        // Must at least hold the preamble and the root layer.
        if data.len() < layout::CID + 16 {
            return Err(PacketError::InvalidLength(data.len()));
        }

        // E1.31 5.1 Preamble Size
        if data[0..2] != layout::PREAMBLE[0..2] {
            return Err(PacketError::InvalidPreambleSize(u16::from_be_bytes([data[0], data[1]])));
        }

        // E1.31 5.2 Postamble Size
        if data[2..4] != layout::PREAMBLE[2..4] {
            return Err(PacketError::InvalidPostambleSize(u16::from_be_bytes([data[2], data[3]])));
        }

        // E1.31 5.3 ACN Packet Identifier
        if data[4..16] != layout::PREAMBLE[4..16] {
            return Err(PacketError::InvalidAcnIdentifier(data[4..16].to_vec()));
        }

        // The root layer vector selects the framing.
        let root_vector: [u8; 4] =
            data[layout::ROOT_VECTOR..layout::ROOT_VECTOR + 4].try_into().unwrap();
        let version = if root_vector == layout::RATIFIED.root_vector {
            ProtocolVersion::Ratified
        } else if root_vector == layout::DRAFT.root_vector {
            ProtocolVersion::Draft
        } else {
            return Err(PacketError::UnsupportedVersion(root_vector.to_vec()));
        };

        let layout = version.layout();
        if data.len() < layout.header_size() {
            return Err(PacketError::InvalidLength(data.len()));
        }

        // E1.31 5.6 CID
        let cid =
            ComponentIdentifier::from_bytes(data[layout::CID..layout::CID + 16].try_into().unwrap());

        // E1.31 6.2.1 Data Packet: Vector
        let framing_vector: [u8; 4] =
            data[layout::FRAMING_VECTOR..layout::FRAMING_VECTOR + 4].try_into().unwrap();
        if framing_vector != layout::FRAMING_VECTOR_VALUE {
            return Err(PacketError::InvalidFramingVector(framing_vector.to_vec()));
        }

        // E1.31 6.2.2 Data Packet: Source Name
        let source_name =
            read_source_name(&data[layout.source_name..layout.source_name + layout.source_name_size]);

        // E1.31 6.2.3 Data Packet: Priority
        let priority = data[layout.priority];
        validate_priority(priority)?;

        // E1.31 6.2.4 Data Packet: Synchronization Address
        let synchronization_address = match layout.synchronization_address {
            Some(offset) => u16::from_be_bytes([data[offset], data[offset + 1]]),
            None => 0,
        };

        // E1.31 6.2.5 Data Packet: Sequence Number
        let sequence_number = data[layout.sequence_number];

        // E1.31 6.2.6 Data Packet: Options
        let options = data[layout.options];

        // E1.31 6.2.7 Data Packet: Universe
        let universe = u16::from_be_bytes([data[layout.universe], data[layout.universe + 1]]);
        validate_universe_number(universe)?;

        // E1.31 7.2 DMP Layer: Vector
        let dmp_vector = data[layout.dmp_vector()];
        if dmp_vector != layout::DMP_VECTOR_VALUE {
            return Err(PacketError::InvalidDmpVector(dmp_vector));
        }

        // E1.31 7.3 Address Type and Data Type
        let address_type = data[layout.address_type()];
        if address_type != layout::ADDRESS_TYPE_VALUE {
            return Err(PacketError::InvalidDmpAddressType(address_type));
        }

        // E1.31 7.4 First Property Address
        let first_address = u16::from_be_bytes([
            data[layout.first_property_address()],
            data[layout.first_property_address() + 1],
        ]);
        if first_address != layout::FIRST_PROPERTY_ADDRESS_VALUE {
            return Err(PacketError::InvalidDmpFirstPropertyAddress(first_address));
        }

        // E1.31 7.5 Address Increment
        let increment = u16::from_be_bytes([
            data[layout.address_increment()],
            data[layout.address_increment() + 1],
        ]);
        if increment != layout::ADDRESS_INCREMENT_VALUE {
            return Err(PacketError::InvalidDmpAddressIncrement(increment));
        }

        // E1.31 7.6 Property Value Count: the start code plus the data
        // slots, which must exactly fill the rest of the datagram.
        let declared =
            u16::from_be_bytes([data[layout.property_count()], data[layout.property_count() + 1]]);
        let actual = data.len() - layout.start_code();
        if declared as usize != actual || actual == 0 || actual > 1 + UNIVERSE_SIZE {
            return Err(PacketError::InvalidPropertyValueCount { declared, actual });
        }

        // E1.31 7.7 Property Values
        let start_code = data[layout.start_code()];
        let mut slots = ArrayVec::new();
        slots.try_extend_from_slice(&data[layout.header_size()..])
            .map_err(|_| PacketError::InvalidSlotCount(actual - 1))?;

        Ok(DataPacket {
            cid,
            source_name,
            priority,
            synchronization_address,
            sequence_number,
            preview_data: options & PREVIEW_DATA_BIT == PREVIEW_DATA_BIT,
            stream_terminated: options & STREAM_TERMINATED_BIT == STREAM_TERMINATED_BIT,
            force_synchronization: options & FORCE_SYNCHRONIZATION_BIT == FORCE_SYNCHRONIZATION_BIT,
            universe,
            start_code,
            slots,
            version,
        })
    }

    /// Encodes this [DataPacket] into a network ordered [`Vec<u8>`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = SendBuffer::new(
            self.version,
            self.cid,
            &self.source_name,
            self.priority,
            self.start_code,
            self.universe,
            self.slots.len(),
        )?;
        buffer.set_sequence_number(self.sequence_number);
        buffer.set_synchronization_address(self.synchronization_address);
        buffer.set_preview_data(self.preview_data);
        buffer.set_stream_terminated(self.stream_terminated);
        buffer.set_force_synchronization(self.force_synchronization);
        buffer.slots_mut().copy_from_slice(&self.slots);
        Ok(buffer.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(version: ProtocolVersion) -> DataPacket {
        let mut slots = ArrayVec::new();
        for i in 0..UNIVERSE_SIZE {
            slots.push((i % 256) as u8);
        }

        DataPacket {
            cid: ComponentIdentifier::new_v4(),
            source_name: "roundtrip".to_string(),
            priority: 150,
            synchronization_address: 0,
            sequence_number: 17,
            preview_data: true,
            stream_terminated: false,
            force_synchronization: true,
            universe: 63999,
            start_code: 0x00,
            slots,
            version,
        }
    }

    #[test]
    fn ratified_packet_round_trips() {
        let mut original = packet(ProtocolVersion::Ratified);
        original.synchronization_address = 7962;
        let decoded = DataPacket::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn draft_packet_round_trips() {
        let original = packet(ProtocolVersion::Draft);
        let decoded = DataPacket::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn priority_start_code_round_trips() {
        let mut original = packet(ProtocolVersion::Ratified);
        original.start_code = crate::packet::STARTCODE_PRIORITY;
        let decoded = DataPacket::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.start_code, crate::packet::STARTCODE_PRIORITY);
    }

    #[test]
    fn minimum_packet_is_start_code_only() {
        let mut original = packet(ProtocolVersion::Ratified);
        original.slots.clear();
        let bytes = original.encode().unwrap();
        assert_eq!(bytes.len(), 126);
        let decoded = DataPacket::decode(&bytes).unwrap();
        assert!(decoded.slots.is_empty());
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        let err = DataPacket::decode(&bytes[..20]).unwrap_err();
        assert!(matches!(err, PacketError::InvalidLength(20)));
    }

    #[test]
    fn bad_acn_identifier_is_rejected() {
        let mut bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        bytes[4] = b'X';
        let err = DataPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::InvalidAcnIdentifier(_)));
    }

    #[test]
    fn unknown_root_vector_is_unsupported_version() {
        let mut bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        bytes[21] = 0x09;
        let err = DataPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::UnsupportedVersion(_)));
    }

    #[test]
    fn property_count_mismatch_is_rejected() {
        let mut bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        // Declare one more property value than the datagram holds.
        bytes[124] = bytes[124].wrapping_add(1);
        let err = DataPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::InvalidPropertyValueCount { .. }));
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let mut bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        bytes[108] = 201;
        let err = DataPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::InvalidPriority(201)));
    }

    #[test]
    fn universe_zero_on_the_wire_is_rejected() {
        let mut bytes = packet(ProtocolVersion::Ratified).encode().unwrap();
        bytes[113] = 0;
        bytes[114] = 0;
        let err = DataPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::InvalidUniverseNumber(0)));
    }

    #[test]
    fn draft_and_ratified_differ_in_size() {
        let ratified = packet(ProtocolVersion::Ratified).encode().unwrap();
        let draft = packet(ProtocolVersion::Draft).encode().unwrap();
        assert_eq!(ratified.len(), 638);
        assert_eq!(draft.len(), 604);
    }
}
