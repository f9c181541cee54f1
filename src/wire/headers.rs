use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::wire::priority::Priority;
use crate::wire::segment_type::SegmentType;

pub const EYECATCHER: u16 = 0xBEEF;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransmissionFlags: u16 {
        /// the sender does not need the buffers back and they may be pooled by the receiver
        const POOLED = 0x1000;
        /// the sender expects a reply with the same request number
        const EXCHANGE = 0x4000;
    }
}

const PRIORITY_MASK: u16 = 0x000F;

/// ```ascii
/// 0: eyecatcher (u16) 0xBEEF
/// 2: segment length (u32) - the whole frame including all headers
/// 6: flags (u16) - bits 0-3 are the priority
/// 8: packet number (u8)
/// 9: segment type (u8)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub segment_length: u32,
    pub priority: Priority,
    pub flags: TransmissionFlags,
    pub packet_number: u8,
    pub segment_type: SegmentType,
}

impl PrimaryHeader {
    pub const SERIALIZED_LEN: usize = 10;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(EYECATCHER);
        buf.put_u32(self.segment_length);
        buf.put_u16(self.flags.bits() | (self.priority.value() as u16));
        buf.put_u8(self.packet_number);
        buf.put_u8(self.segment_type.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PrimaryHeader> {
        let eyecatcher = buf.try_get_u16()?;
        if eyecatcher != EYECATCHER {
            bail!("invalid eyecatcher 0x{:04X}", eyecatcher);
        }
        let segment_length = buf.try_get_u32()?;
        let raw_flags = buf.try_get_u16()?;
        let packet_number = buf.try_get_u8()?;
        let segment_type = SegmentType(buf.try_get_u8()?);

        Ok(PrimaryHeader {
            segment_length,
            priority: Priority::try_new((raw_flags & PRIORITY_MASK) as u8)?,
            flags: TransmissionFlags::from_bits_truncate(raw_flags),
            packet_number,
            segment_type,
        })
    }
}

/// ```ascii
/// 0: conversation id (u16)
/// 2: request number (u16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationHeader {
    pub conversation_id: u16,
    pub request_number: u16,
}

impl ConversationHeader {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.conversation_id);
        buf.put_u16(self.request_number);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConversationHeader> {
        let conversation_id = buf.try_get_u16()?;
        let request_number = buf.try_get_u16()?;
        Ok(ConversationHeader {
            conversation_id,
            request_number,
        })
    }
}

/// ```ascii
/// 0: total length of the reassembled payload (u64)
/// 8: segment type of the reassembled transmission (u8)
/// 9: padding (3 bytes)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStartHeader {
    pub total_length: u64,
    pub segment_type: SegmentType,
}

impl SegmentStartHeader {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.total_length);
        buf.put_u8(self.segment_type.0);
        buf.put_bytes(0, 3);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentStartHeader> {
        let total_length = buf.try_get_u64()?;
        if total_length > i64::MAX as u64 {
            bail!("negative total length in segment start header");
        }
        let segment_type = SegmentType(buf.try_get_u8()?);
        if buf.remaining() < 3 {
            bail!("segment start header is truncated");
        }
        buf.advance(3);
        Ok(SegmentStartHeader {
            total_length,
            segment_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(PrimaryHeader { segment_length: 14, priority: Priority::LOWEST, flags: TransmissionFlags::empty(), packet_number: 0, segment_type: SegmentType::SEND },
        vec![0xBE,0xEF, 0,0,0,14, 0,0, 0, 0x30])]
    #[case::exchange(PrimaryHeader { segment_length: 0x01020304, priority: Priority::HIGHEST_USER, flags: TransmissionFlags::EXCHANGE, packet_number: 7, segment_type: SegmentType::HANDSHAKE },
        vec![0xBE,0xEF, 1,2,3,4, 0x40,0x0C, 7, 0x10])]
    #[case::pooled_heartbeat(PrimaryHeader { segment_length: 10, priority: Priority::HEARTBEAT, flags: TransmissionFlags::POOLED, packet_number: 255, segment_type: SegmentType::HEARTBEAT },
        vec![0xBE,0xEF, 0,0,0,10, 0x10,0x0F, 255, 1])]
    fn test_primary_header(#[case] header: PrimaryHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        let deser = PrimaryHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_primary_header_bad_eyecatcher() {
        let mut b: &[u8] = &[0xBE, 0xEE, 0, 0, 0, 10, 0, 0, 0, 1];
        assert!(PrimaryHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_primary_header_truncated() {
        let mut b: &[u8] = &[0xBE, 0xEF, 0, 0, 0];
        assert!(PrimaryHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_conversation_header() {
        let mut buf = BytesMut::new();
        ConversationHeader { conversation_id: 0x0102, request_number: 0xFFFE }.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1, 2, 0xFF, 0xFE]);

        let mut b: &[u8] = &buf;
        assert_eq!(ConversationHeader::deser(&mut b).unwrap(), ConversationHeader { conversation_id: 0x0102, request_number: 0xFFFE });
    }

    #[test]
    fn test_segment_start_header() {
        let header = SegmentStartHeader { total_length: 3*1024*1024, segment_type: SegmentType::SEND };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0,0,0,0,0,0x30,0,0, 0x30, 0,0,0]);

        let mut b: &[u8] = &buf;
        assert_eq!(SegmentStartHeader::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[test]
    fn test_segment_start_header_negative_length() {
        let mut b: &[u8] = &[0x80,0,0,0,0,0,0,1, 0x30, 0,0,0];
        assert!(SegmentStartHeader::deser(&mut b).is_err());
    }
}
