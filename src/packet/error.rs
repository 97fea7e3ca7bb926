/// Error type for packets that fail to validate or encode.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The datagram is shorter than the layer being decoded.
    #[error("invalid packet length: {0}")]
    InvalidLength(usize),

    /// Invalid preamble size field.
    #[error("invalid preamble size in preamble: {0:#06x}")]
    InvalidPreambleSize(u16),
    /// Invalid postamble size field.
    #[error("invalid postamble size in preamble: {0:#06x}")]
    InvalidPostambleSize(u16),
    /// Invalid ACN packet identifier.
    #[error("invalid ACN packet identifier in preamble: {0:?}")]
    InvalidAcnIdentifier(Vec<u8>),

    /// The root layer vector matches neither the draft nor the ratified framing.
    #[error("unsupported protocol version, root vector: {0:02x?}")]
    UnsupportedVersion(Vec<u8>),
    /// Invalid framing layer vector.
    #[error("invalid framing layer vector: {0:02x?}")]
    InvalidFramingVector(Vec<u8>),

    /// Invalid DMP layer vector.
    #[error("invalid DMP layer vector: {0:#04x}")]
    InvalidDmpVector(u8),
    /// Invalid DMP address type and data type.
    #[error("invalid DMP address and data type: {0:#04x}")]
    InvalidDmpAddressType(u8),
    /// Invalid DMP first property address.
    #[error("invalid DMP first property address: {0:#06x}")]
    InvalidDmpFirstPropertyAddress(u16),
    /// Invalid DMP address increment.
    #[error("invalid DMP address increment: {0:#06x}")]
    InvalidDmpAddressIncrement(u16),
    /// The declared property value count does not match the slot data present.
    #[error("property value count {declared} does not match {actual} slots on the wire")]
    InvalidPropertyValueCount {
        /// Count declared in the DMP layer.
        declared: u16,
        /// Property values actually present in the datagram.
        actual: usize,
    },

    /// Invalid priority.
    #[error("invalid priority: {0}. Must be between 0 and 200.")]
    InvalidPriority(u8),
    /// Invalid source name length.
    #[error("invalid source name length: {got}. Must be at most {max} bytes.")]
    InvalidSourceNameLength {
        /// Byte length of the rejected name.
        got: usize,
        /// Maximum the framing allows.
        max: usize,
    },
    /// Universe number outside 1..=63999.
    #[error("invalid universe number: {0}")]
    InvalidUniverseNumber(u16),
    /// More data slots than a universe holds.
    #[error("invalid slot count: {0}")]
    InvalidSlotCount(usize),
}
