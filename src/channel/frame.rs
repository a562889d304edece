use super::ProtocolError;

/// Flag bit marking the sender's final frame on a channel.
pub(crate) const FLAG_END_OF_STREAM: u8 = 1 << 0;

const KNOWN_FLAGS: u8 = FLAG_END_OF_STREAM;

/// Header preceding every payload on the wire.
///
/// # Wire Format
///
/// All integers are little-endian:
///
/// ```text
/// u32  channel_id
/// u32  sender_rank
/// u32  payload_bytes
/// u32  element_count
/// u8   flags           (bit 0 = END_OF_STREAM)
/// u8[] payload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel the payload belongs to.
    pub channel: u32,
    /// Rank of the emitting worker.
    pub sender: u32,
    /// Number of payload bytes following the header.
    pub payload_bytes: u32,
    /// Number of serialized elements ending in the payload.
    pub element_count: u32,
    /// Frame flags.
    pub flags: u8,
}

impl FrameHeader {
    /// Serialized header size in bytes.
    pub const WIRE_LEN: usize = 17;

    /// Builds a data-frame header.
    pub(crate) fn data(channel: u32, sender: u32, payload_bytes: u32, element_count: u32) -> Self {
        Self {
            channel,
            sender,
            payload_bytes,
            element_count,
            flags: 0,
        }
    }

    /// Builds the end-of-stream marker frame for `(channel, sender)`.
    pub(crate) fn end_of_stream(channel: u32, sender: u32) -> Self {
        Self {
            channel,
            sender,
            payload_bytes: 0,
            element_count: 0,
            flags: FLAG_END_OF_STREAM,
        }
    }

    /// Returns `true` if the END_OF_STREAM flag is set.
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }

    /// Serializes the header into its wire representation.
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut bytes = [0u8; Self::WIRE_LEN];
        bytes[0..4].copy_from_slice(&self.channel.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.sender.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.payload_bytes.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.element_count.to_le_bytes());
        bytes[16] = self.flags;
        bytes
    }

    /// Parses a header from its wire representation.
    pub fn decode(bytes: &[u8; Self::WIRE_LEN]) -> Result<Self, ProtocolError> {
        let flags = bytes[16];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(ProtocolError::UnknownFlags { flags });
        }
        Ok(Self {
            channel: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            sender: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            payload_bytes: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            element_count: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::data(3, 1, 4096, 17);
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(!decoded.is_end_of_stream());
    }

    #[test]
    fn end_of_stream_round_trip() {
        let header = FrameHeader::end_of_stream(9, 2);
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_end_of_stream());
        assert_eq!(decoded.payload_bytes, 0);
    }

    #[test]
    fn layout_is_little_endian() {
        let header = FrameHeader::data(0x0102_0304, 5, 6, 7);
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[4], 5);
        assert_eq!(bytes[8], 6);
        assert_eq!(bytes[12], 7);
        assert_eq!(bytes[16], 0);
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut bytes = FrameHeader::data(1, 0, 0, 0).encode();
        bytes[16] = 0x80;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(ProtocolError::UnknownFlags { flags: 0x80 })
        ));
    }
}
