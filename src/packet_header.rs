use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sequence_number::SequenceNumber;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    /// handshake, sent by the side that opens a connection until the peer acknowledges it
    Connect = 1,
    Data = 2,
    /// cumulative acknowledgement, with the set of selectively acknowledged sequence numbers
    ///  as payload
    Ack = 3,
    /// request to re-send the sequence numbers listed in the payload
    Nak = 4,
    StatusQuery = 5,
    StatusReply = 6,
    /// end of stream - sequenced like DATA, but without payload
    Fin = 7,
}

impl PacketKind {
    pub fn is_sequenced(&self) -> bool {
        matches!(self, PacketKind::Data | PacketKind::Fin)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub instance_id: u32,
    pub channel_id: u16,
    pub sequence: SequenceNumber,
    /// the highest contiguous sequence number received from the peer, ZERO for 'none'
    pub ack_sequence: SequenceNumber,
}

/// Reason for rejecting a datagram. All of these are handled the same way (drop the packet and
///  count a checksum error), the distinction is for logging.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CorruptPacket {
    TooShort { len: usize },
    ChecksumMismatch { declared: u32, actual: u32 },
    UnsupportedVersion(u8),
    UnknownKind(u8),
    PayloadLengthMismatch { declared: usize, actual: usize },
}

impl Display for CorruptPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptPacket::TooShort { len } => write!(f, "datagram of {} bytes is shorter than the packet header", len),
            CorruptPacket::ChecksumMismatch { declared, actual } => write!(f, "checksum mismatch: declared {:08x}, actual {:08x}", declared, actual),
            CorruptPacket::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            CorruptPacket::UnknownKind(k) => write!(f, "unknown packet kind {}", k),
            CorruptPacket::PayloadLengthMismatch { declared, actual } => write!(f, "declared payload length {} but {} bytes follow the header", declared, actual),
        }
    }
}

impl std::error::Error for CorruptPacket {}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    const CHECKSUM_LEN: usize = size_of::<u32>();
    pub const SERIALIZED_LEN: usize = Self::CHECKSUM_LEN
        + size_of::<u8>()   // version
        + size_of::<u8>()   // kind
        + size_of::<u32>()  // instance id
        + size_of::<u16>()  // channel id
        + size_of::<u64>()  // sequence
        + size_of::<u64>()  // ack sequence
        + size_of::<u16>(); // payload length

    /// Largest datagram that fits a UDP packet over IP V4
    pub const MAX_DATAGRAM_SIZE: usize = 65507;

    pub fn new(kind: PacketKind, instance_id: u32, channel_id: u16, sequence: SequenceNumber, ack_sequence: SequenceNumber) -> PacketHeader {
        PacketHeader {
            kind,
            instance_id,
            channel_id,
            sequence,
            ack_sequence,
        }
    }

    /// Frame header and payload, appending them to `buf`. The checksum is calculated last, over
    ///  everything that was written after it.
    ///
    /// NB: Callers are responsible for checking the payload against the maximum payload size,
    ///      this function panics if the buffer is too small
    pub fn encode<B: BufMut + AsMut<[u8]>>(&self, payload: &[u8], buf: &mut B) {
        let start = buf.as_mut().len();

        buf.put_u32(0);
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.kind.into());
        buf.put_u32(self.instance_id);
        buf.put_u16(self.channel_id);
        buf.put_u64(self.sequence.to_raw());
        buf.put_u64(self.ack_sequence.to_raw());
        buf.put_u16(payload.len().prechecked_cast());
        buf.put_slice(payload);

        let framed = &mut buf.as_mut()[start..];
        let checksum = CASTAGNOLI.checksum(&framed[Self::CHECKSUM_LEN..]);
        framed[..Self::CHECKSUM_LEN].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parse and validate a datagram. The checksum is verified before any other field is
    ///  looked at.
    pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, &[u8]), CorruptPacket> {
        if datagram.len() < Self::SERIALIZED_LEN {
            return Err(CorruptPacket::TooShort { len: datagram.len() });
        }

        let mut buf = datagram;
        let declared = buf.get_u32();
        let actual = CASTAGNOLI.checksum(&datagram[Self::CHECKSUM_LEN..]);
        if declared != actual {
            return Err(CorruptPacket::ChecksumMismatch { declared, actual });
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            return Err(CorruptPacket::UnsupportedVersion(version));
        }

        let kind = PacketKind::try_from(buf.get_u8())
            .map_err(|e| CorruptPacket::UnknownKind(e.number))?;
        let instance_id = buf.get_u32();
        let channel_id = buf.get_u16();
        let sequence = SequenceNumber::from_raw(buf.get_u64());
        let ack_sequence = SequenceNumber::from_raw(buf.get_u64());

        let payload_len: usize = buf.get_u16().safe_cast();
        if payload_len != buf.len() {
            return Err(CorruptPacket::PayloadLengthMismatch { declared: payload_len, actual: buf.len() });
        }

        Ok((PacketHeader { kind, instance_id, channel_id, sequence, ack_sequence }, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::fixed_buffer::FixedBuf;
    use bytes::BytesMut;
    use rstest::rstest;

    fn data_header() -> PacketHeader {
        PacketHeader::new(PacketKind::Data, 17, 3, SequenceNumber::from_raw(5), SequenceNumber::from_raw(2))
    }

    #[test]
    fn test_serialized_len() {
        assert_eq!(PacketHeader::SERIALIZED_LEN, 30);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        data_header().encode(&[9, 8], &mut buf);

        assert_eq!(&buf[4..], &[
            1, 2,
            0, 0, 0, 17,
            0, 3,
            0, 0, 0, 0, 0, 0, 0, 5,
            0, 0, 0, 0, 0, 0, 0, 2,
            0, 2,
            9, 8,
        ]);
        assert_eq!(&buf[..4], &CASTAGNOLI.checksum(&buf[4..]).to_be_bytes());
    }

    #[rstest]
    #[case::connect(PacketKind::Connect, vec![])]
    #[case::data(PacketKind::Data, vec![1, 2, 3, 4, 5])]
    #[case::ack(PacketKind::Ack, vec![0])]
    #[case::nak(PacketKind::Nak, vec![1, 0, 0, 0, 0, 0, 0, 0, 4])]
    #[case::status_query(PacketKind::StatusQuery, vec![])]
    #[case::status_reply(PacketKind::StatusReply, vec![])]
    #[case::fin(PacketKind::Fin, vec![])]
    fn test_decode_encoded(#[case] kind: PacketKind, #[case] payload: Vec<u8>) {
        let header = PacketHeader::new(kind, u32::MAX, 9, SequenceNumber::from_raw(u64::MAX), SequenceNumber::ZERO);

        let mut buf = FixedBuf::new(100);
        header.encode(&payload, &mut buf);

        let (decoded, decoded_payload) = PacketHeader::decode(buf.as_ref()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded_payload, payload.as_slice());
    }

    #[test]
    fn test_encode_appends_after_existing_content() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        data_header().encode(&[1], &mut buf);

        assert!(PacketHeader::decode(&buf[1..]).is_ok());
    }

    #[test]
    fn test_every_single_byte_corruption_is_detected() {
        let mut buf = BytesMut::new();
        data_header().encode(b"tuple data", &mut buf);

        for i in 0..buf.len() {
            let mut corrupted = buf.to_vec();
            corrupted[i] ^= 0x20;
            assert!(PacketHeader::decode(&corrupted).is_err(), "corruption at offset {} was not detected", i);
        }
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_short(29)]
    fn test_too_short(#[case] len: usize) {
        assert_eq!(PacketHeader::decode(&vec![0; len]), Err(CorruptPacket::TooShort { len }));
    }

    fn with_valid_checksum(mut raw: Vec<u8>) -> Vec<u8> {
        let checksum = CASTAGNOLI.checksum(&raw[4..]);
        raw[..4].copy_from_slice(&checksum.to_be_bytes());
        raw
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = BytesMut::new();
        data_header().encode(&[1, 2, 3], &mut buf);
        let truncated = with_valid_checksum(buf[..buf.len() - 1].to_vec());

        assert_eq!(PacketHeader::decode(&truncated), Err(CorruptPacket::PayloadLengthMismatch { declared: 3, actual: 2 }));
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BytesMut::new();
        data_header().encode(&[], &mut buf);
        let mut raw = buf.to_vec();
        raw[5] = 77;

        assert_eq!(PacketHeader::decode(&with_valid_checksum(raw)), Err(CorruptPacket::UnknownKind(77)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::new();
        data_header().encode(&[], &mut buf);
        let mut raw = buf.to_vec();
        raw[4] = 2;

        assert_eq!(PacketHeader::decode(&with_valid_checksum(raw)), Err(CorruptPacket::UnsupportedVersion(2)));
    }
}
