use anyhow::bail;
use bytes::{Bytes, BytesMut};

use crate::wire::headers::{ConversationHeader, PrimaryHeader, SegmentStartHeader, TransmissionFlags};
use crate::wire::priority::Priority;
use crate::wire::segment_type::{FrameLayout, SegmentType};

/// A logical unit of data on a connection, before segmentation / after reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub segment_type: SegmentType,
    /// 0 for connection-scoped segment types
    pub conversation_id: u16,
    pub request_number: u16,
    pub priority: Priority,
    pub flags: TransmissionFlags,
    pub payload: Bytes,
}

impl Transmission {
    pub fn connection_scoped(segment_type: SegmentType, priority: Priority, payload: Bytes) -> Transmission {
        Transmission {
            segment_type,
            conversation_id: 0,
            request_number: 0,
            priority,
            flags: TransmissionFlags::empty(),
            payload,
        }
    }

    pub fn is_exchange(&self) -> bool {
        self.flags.contains(TransmissionFlags::EXCHANGE)
    }
}

/// Turns transmissions into frames for one direction of one connection. Packet numbers are
///  assigned here, so frames must be written in the order in which they are encoded.
pub struct Framer {
    max_transmission_size: usize,
    next_packet_number: u8,
}

impl Framer {
    /// The smallest max transmission size that still leaves room for one payload byte in a
    ///  segmented-start frame
    pub const MIN_MAX_TRANSMISSION_SIZE: u32 = (PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN + SegmentStartHeader::SERIALIZED_LEN + 1) as u32;

    pub fn new(max_transmission_size: u32) -> Framer {
        Framer {
            max_transmission_size: max_transmission_size as usize,
            next_packet_number: 0,
        }
    }

    /// The largest payload that fits into a single conversation-scoped frame
    pub fn payload_capacity(&self) -> usize {
        self.max_transmission_size
            .saturating_sub(PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN)
    }

    pub fn set_max_transmission_size(&mut self, max_transmission_size: u32) {
        self.max_transmission_size = max_transmission_size as usize;
    }

    /// Appends the frames for a transmission to `buf`, returning the number of frames
    pub fn encode(&mut self, transmission: &Transmission, buf: &mut BytesMut) -> anyhow::Result<usize> {
        match transmission.segment_type.frame_layout()? {
            FrameLayout::PrimaryOnly => {
                let len = PrimaryHeader::SERIALIZED_LEN + transmission.payload.len();
                if len > self.max_transmission_size {
                    bail!("connection-scoped {:?} with {} bytes exceeds the max transmission size", transmission.segment_type, transmission.payload.len());
                }
                self.put_primary_header(transmission, transmission.segment_type, len, buf);
                buf.extend_from_slice(&transmission.payload);
                Ok(1)
            }
            FrameLayout::Conversation => {
                if self.max_transmission_size < Self::MIN_MAX_TRANSMISSION_SIZE as usize {
                    bail!("max transmission size {} is too small for conversation frames", self.max_transmission_size);
                }
                if transmission.payload.len() <= self.payload_capacity() {
                    self.put_conversation_frame(transmission, transmission.segment_type, &transmission.payload, buf);
                    Ok(1)
                }
                else {
                    Ok(self.encode_segmented(transmission, buf))
                }
            }
            _ => bail!("{:?} is reserved for segmentation and cannot be sent directly", transmission.segment_type),
        }
    }

    fn encode_segmented(&mut self, transmission: &Transmission, buf: &mut BytesMut) -> usize {
        let payload = &transmission.payload;
        let first_chunk_len = self.payload_capacity() - SegmentStartHeader::SERIALIZED_LEN;

        let start_len = PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN + SegmentStartHeader::SERIALIZED_LEN + first_chunk_len;
        self.put_primary_header(transmission, SegmentType::SEGMENTED_START, start_len, buf);
        Self::put_conversation_header(transmission, buf);
        SegmentStartHeader {
            total_length: payload.len() as u64,
            segment_type: transmission.segment_type,
        }.ser(buf);
        buf.extend_from_slice(&payload[..first_chunk_len]);

        let mut num_frames = 1;
        let mut remaining = &payload[first_chunk_len..];
        while remaining.len() > self.payload_capacity() {
            let (chunk, rest) = remaining.split_at(self.payload_capacity());
            self.put_conversation_frame(transmission, SegmentType::SEGMENTED_MIDDLE, chunk, buf);
            remaining = rest;
            num_frames += 1;
        }
        self.put_conversation_frame(transmission, SegmentType::SEGMENTED_END, remaining, buf);
        num_frames + 1
    }

    fn put_conversation_frame(&mut self, transmission: &Transmission, segment_type: SegmentType, chunk: &[u8], buf: &mut BytesMut) {
        let len = PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN + chunk.len();
        self.put_primary_header(transmission, segment_type, len, buf);
        Self::put_conversation_header(transmission, buf);
        buf.extend_from_slice(chunk);
    }

    fn put_primary_header(&mut self, transmission: &Transmission, segment_type: SegmentType, segment_length: usize, buf: &mut BytesMut) {
        PrimaryHeader {
            // always <= max_transmission_size, which is a u32
            segment_length: segment_length as u32,
            priority: transmission.priority,
            flags: transmission.flags,
            packet_number: self.next_packet_number,
            segment_type,
        }.ser(buf);
        self.next_packet_number = self.next_packet_number.wrapping_add(1);
    }

    fn put_conversation_header(transmission: &Transmission, buf: &mut BytesMut) {
        ConversationHeader {
            conversation_id: transmission.conversation_id,
            request_number: transmission.request_number,
        }.ser(buf);
    }
}
