use std::collections::hash_map::Entry;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::wire::framer::Transmission;
use crate::wire::headers::{ConversationHeader, PrimaryHeader, SegmentStartHeader, EYECATCHER};
use crate::wire::segment_type::{FrameLayout, SegmentType};

/// A single frame as it was read from the wire
#[derive(Debug)]
pub struct Frame {
    pub header: PrimaryHeader,
    pub conversation: Option<ConversationHeader>,
    pub segment_start: Option<SegmentStartHeader>,
    pub layout: FrameLayout,
    pub payload: Bytes,
}

struct PartialTransmission {
    start: Transmission,
    total_length: usize,
    buf: BytesMut,
}

/// Parses the inbound byte stream of one connection into transmissions, reassembling segmented
///  flows. Any error returned by this parser is a framing error, and the stream can not be
///  recovered.
pub struct InboundParser {
    max_transmission_size: usize,
    max_message_size: u64,
    expected_packet_number: u8,
    in_progress: FxHashMap<u16, PartialTransmission>,
}

impl InboundParser {
    pub fn new(max_transmission_size: u32, max_message_size: u64) -> InboundParser {
        InboundParser {
            max_transmission_size: max_transmission_size as usize,
            max_message_size,
            expected_packet_number: 0,
            in_progress: Default::default(),
        }
    }

    pub fn set_max_transmission_size(&mut self, max_transmission_size: u32) {
        self.max_transmission_size = max_transmission_size as usize;
    }

    /// Consumes all complete frames from the start of `buf`, returning the transmissions they
    ///  complete. Bytes of an incomplete trailing frame stay in `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> anyhow::Result<Vec<Transmission>> {
        let mut result = Vec::new();
        while let Some(frame) = self.try_parse_frame(buf)? {
            if let Some(transmission) = self.on_frame(frame)? {
                result.push(transmission);
            }
        }
        Ok(result)
    }

    pub fn try_parse_frame(&mut self, buf: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
        if buf.len() >= 2 {
            let eyecatcher = u16::from_be_bytes([buf[0], buf[1]]);
            if eyecatcher != EYECATCHER {
                bail!("invalid eyecatcher 0x{:04X}", eyecatcher);
            }
        }
        if buf.len() < PrimaryHeader::SERIALIZED_LEN {
            return Ok(None);
        }

        let segment_length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        let layout = SegmentType(buf[9]).frame_layout()?;
        let min_length = Self::header_length(layout);
        if segment_length < min_length {
            bail!("segment length {} is shorter than the {} bytes of headers for {:?}", segment_length, min_length, layout);
        }
        if segment_length > self.max_transmission_size {
            bail!("segment length {} exceeds the max transmission size of {}", segment_length, self.max_transmission_size);
        }
        if buf.len() < segment_length {
            return Ok(None);
        }

        let mut frame_buf = buf.split_to(segment_length).freeze();
        let header = PrimaryHeader::deser(&mut frame_buf)?;
        if header.packet_number != self.expected_packet_number {
            bail!("expected packet number {}, received {}", self.expected_packet_number, header.packet_number);
        }
        self.expected_packet_number = self.expected_packet_number.wrapping_add(1);

        let conversation = match layout {
            FrameLayout::PrimaryOnly => None,
            _ => Some(ConversationHeader::deser(&mut frame_buf)?),
        };
        let segment_start = match layout {
            FrameLayout::SegmentStart => Some(SegmentStartHeader::deser(&mut frame_buf)?),
            _ => None,
        };

        trace!(?header, ?conversation, "parsed frame");
        Ok(Some(Frame {
            header,
            conversation,
            segment_start,
            layout,
            payload: frame_buf,
        }))
    }

    fn header_length(layout: FrameLayout) -> usize {
        match layout {
            FrameLayout::PrimaryOnly => PrimaryHeader::SERIALIZED_LEN,
            FrameLayout::SegmentStart => PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN + SegmentStartHeader::SERIALIZED_LEN,
            _ => PrimaryHeader::SERIALIZED_LEN + ConversationHeader::SERIALIZED_LEN,
        }
    }

    fn on_frame(&mut self, frame: Frame) -> anyhow::Result<Option<Transmission>> {
        let (conversation_id, request_number) = match frame.conversation {
            Some(c) => (c.conversation_id, c.request_number),
            None => (0, 0),
        };

        match frame.layout {
            FrameLayout::PrimaryOnly | FrameLayout::Conversation => {
                Ok(Some(Transmission {
                    segment_type: frame.header.segment_type,
                    conversation_id,
                    request_number,
                    priority: frame.header.priority,
                    flags: frame.header.flags,
                    payload: frame.payload,
                }))
            }
            FrameLayout::SegmentStart => {
                let Some(start) = frame.segment_start else {
                    bail!("segment start frame without segment start header");
                };
                if !start.segment_type.is_segmentable() {
                    bail!("{:?} can not be sent as a segmented flow", start.segment_type);
                }
                if start.total_length > self.max_message_size {
                    bail!("segmented transmission of {} bytes exceeds the max message size of {}", start.total_length, self.max_message_size);
                }
                // a start frame's chunk is always less than the total, the rest follows in middle / end frames
                if (start.total_length as usize) <= frame.payload.len() {
                    bail!("segmented transmission with a total length of {} bytes is complete in its start frame", start.total_length);
                }

                match self.in_progress.entry(conversation_id) {
                    Entry::Occupied(_) => {
                        bail!("segmented transmission started on conversation {} while another one is in progress", conversation_id);
                    }
                    Entry::Vacant(e) => {
                        let mut buf = BytesMut::with_capacity(start.total_length as usize);
                        buf.extend_from_slice(&frame.payload);
                        e.insert(PartialTransmission {
                            start: Transmission {
                                segment_type: start.segment_type,
                                conversation_id,
                                request_number,
                                priority: frame.header.priority,
                                flags: frame.header.flags,
                                payload: Bytes::new(),
                            },
                            total_length: start.total_length as usize,
                            buf,
                        });
                        Ok(None)
                    }
                }
            }
            FrameLayout::SegmentMiddle | FrameLayout::SegmentEnd => {
                let Some(partial) = self.in_progress.get_mut(&conversation_id) else {
                    bail!("{:?} on conversation {} without a preceding segment start", frame.layout, conversation_id);
                };
                if partial.buf.len() + frame.payload.len() > partial.total_length {
                    bail!("segmented transmission on conversation {} exceeds its total length of {}", conversation_id, partial.total_length);
                }
                partial.buf.extend_from_slice(&frame.payload);

                if frame.layout == FrameLayout::SegmentMiddle {
                    return Ok(None);
                }

                let Some(mut partial) = self.in_progress.remove(&conversation_id) else {
                    bail!("segmented transmission on conversation {} disappeared", conversation_id);
                };
                if partial.buf.len() != partial.total_length {
                    bail!("segmented transmission on conversation {} ended after {} of {} bytes", conversation_id, partial.buf.len(), partial.total_length);
                }
                partial.start.payload = partial.buf.freeze();
                Ok(Some(partial.start))
            }
        }
    }

    pub fn remaining_partial(&self) -> usize {
        self.in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::framer::Framer;
    use crate::wire::headers::TransmissionFlags;
    use crate::wire::priority::Priority;
    use rstest::rstest;

    const MAX: u32 = 64;

    fn transmission(payload: Vec<u8>) -> Transmission {
        Transmission {
            segment_type: SegmentType::SEND,
            conversation_id: 17,
            request_number: 4711,
            priority: Priority::try_new(5).unwrap(),
            flags: TransmissionFlags::EXCHANGE | TransmissionFlags::POOLED,
            payload: Bytes::from(payload),
        }
    }

    fn payload_of_len(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::max_minus_one(50 - 1, 1)]
    #[case::max(50, 1)]
    #[case::max_plus_one(50 + 1, 2)]
    #[case::three_times_max(3*50, 4)]
    fn test_round_trip(#[case] payload_len: usize, #[case] expected_frames: usize) {
        let mut framer = Framer::new(MAX);
        assert_eq!(framer.payload_capacity(), 50);

        let original = transmission(payload_of_len(payload_len));
        let mut buf = BytesMut::new();
        assert_eq!(framer.encode(&original, &mut buf).unwrap(), expected_frames);

        let mut parser = InboundParser::new(MAX, 1024);
        let parsed = parser.parse(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(parsed, vec![original]);
        assert_eq!(parser.remaining_partial(), 0);
    }

    #[test]
    fn test_round_trip_default_max_transmission_size() {
        let max = crate::config::DEFAULT_MAX_TRANSMISSION_SIZE;
        let mut framer = Framer::new(max);
        let capacity = framer.payload_capacity();
        let mut parser = InboundParser::new(max, 16*1024*1024);

        for len in [capacity - 1, capacity, capacity + 1, 3 * capacity] {
            let original = transmission(payload_of_len(len));
            let mut buf = BytesMut::new();
            framer.encode(&original, &mut buf).unwrap();
            assert_eq!(parser.parse(&mut buf).unwrap(), vec![original]);
        }
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let mut framer = Framer::new(MAX);
        let original = transmission(payload_of_len(120));
        let mut encoded = BytesMut::new();
        framer.encode(&original, &mut encoded).unwrap();

        let mut parser = InboundParser::new(MAX, 1024);
        let mut buf = BytesMut::new();
        let mut result = Vec::new();
        // feed the stream in small arbitrary pieces
        for chunk in encoded.chunks(7) {
            buf.extend_from_slice(chunk);
            result.extend(parser.parse(&mut buf).unwrap());
        }
        assert_eq!(result, vec![original]);
    }

    fn raw_frame(packet_number: u8, segment_type: SegmentType, conversation_id: u16, start: Option<SegmentStartHeader>, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let headers_len = match start {
            Some(_) => 26,
            None => 14,
        };
        PrimaryHeader {
            segment_length: (headers_len + payload.len()) as u32,
            priority: Priority::LOWEST,
            flags: TransmissionFlags::empty(),
            packet_number,
            segment_type,
        }.ser(&mut buf);
        ConversationHeader { conversation_id, request_number: 0 }.ser(&mut buf);
        if let Some(start) = start {
            start.ser(&mut buf);
        }
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_interleaved_conversations() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&raw_frame(0, SegmentType::SEGMENTED_START, 1, Some(SegmentStartHeader { total_length: 5, segment_type: SegmentType::SEND }), &[1, 2]));
        stream.extend_from_slice(&raw_frame(1, SegmentType::RECEIVE, 2, None, &[9]));
        stream.extend_from_slice(&raw_frame(2, SegmentType::SEGMENTED_START, 3, Some(SegmentStartHeader { total_length: 2, segment_type: SegmentType::RECEIVE }), &[7]));
        stream.extend_from_slice(&raw_frame(3, SegmentType::SEGMENTED_MIDDLE, 1, None, &[3]));
        stream.extend_from_slice(&raw_frame(4, SegmentType::SEGMENTED_END, 3, None, &[8]));
        stream.extend_from_slice(&raw_frame(5, SegmentType::SEGMENTED_END, 1, None, &[4, 5]));

        let mut parser = InboundParser::new(MAX, 1024);
        let parsed = parser.parse(&mut stream).unwrap()
            .into_iter()
            .map(|t| (t.conversation_id, t.segment_type, t.payload.to_vec()))
            .collect::<Vec<_>>();

        assert_eq!(parsed, vec![
            (2, SegmentType::RECEIVE, vec![9]),
            (3, SegmentType::RECEIVE, vec![7, 8]),
            (1, SegmentType::SEND, vec![1, 2, 3, 4, 5]),
        ]);
    }

    #[test]
    fn test_second_start_on_same_conversation() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&raw_frame(0, SegmentType::SEGMENTED_START, 1, Some(SegmentStartHeader { total_length: 5, segment_type: SegmentType::SEND }), &[1, 2]));
        stream.extend_from_slice(&raw_frame(1, SegmentType::SEGMENTED_START, 1, Some(SegmentStartHeader { total_length: 5, segment_type: SegmentType::SEND }), &[1, 2]));

        let mut parser = InboundParser::new(MAX, 1024);
        assert!(parser.parse(&mut stream).is_err());
    }

    #[rstest]
    #[case::bad_eyecatcher(vec![0xBE,0xEE, 0,0,0,14, 0,0, 0, 0x30, 0,1, 0,0])]
    #[case::too_short(vec![0xBE,0xEF, 0,0,0,12, 0,0, 0, 0x30, 0,1, 0,0])]
    #[case::too_long(vec![0xBE,0xEF, 0,0,0,65, 0,0, 0, 0x30, 0,1, 0,0])]
    #[case::segment_type_zero(vec![0xBE,0xEF, 0,0,0,14, 0,0, 0, 0, 0,1, 0,0])]
    #[case::unknown_segment_type(vec![0xBE,0xEF, 0,0,0,14, 0,0, 0, 0x06, 0,1, 0,0])]
    #[case::start_of_unknown_type(vec![0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,0,9, 0x13,0,0,0, 1])]
    #[case::wrong_packet_number(vec![0xBE,0xEF, 0,0,0,14, 0,0, 1, 0x30, 0,1, 0,0])]
    #[case::end_without_start(vec![0xBE,0xEF, 0,0,0,15, 0,0, 0, 0x05, 0,1, 0,0, 9])]
    #[case::middle_without_start(vec![0xBE,0xEF, 0,0,0,15, 0,0, 0, 0x04, 0,1, 0,0, 9])]
    #[case::start_of_heartbeat(vec![0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,0,9, 0x01,0,0,0, 1])]
    #[case::start_complete(vec![0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,0,1, 0x30,0,0,0, 1])]
    #[case::start_exceeds_max_message(vec![0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,8,0, 0x30,0,0,0, 1])]
    fn test_framing_errors(#[case] raw: Vec<u8>) {
        let mut parser = InboundParser::new(MAX, 1024);
        let mut buf = BytesMut::from(raw.as_slice());
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_segmented_flow_longer_than_declared() {
        let mut parser = InboundParser::new(MAX, 1024);
        let mut buf = BytesMut::from(&[
            0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,0,2, 0x30,0,0,0, 1,
            0xBE,0xEF, 0,0,0,16, 0,0, 1, 0x05, 0,1, 0,0, 2,3,
        ][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_segmented_flow_shorter_than_declared() {
        let mut parser = InboundParser::new(MAX, 1024);
        let mut buf = BytesMut::from(&[
            0xBE,0xEF, 0,0,0,27, 0,0, 0, 0x03, 0,1, 0,0, 0,0,0,0,0,0,0,5, 0x30,0,0,0, 1,
            0xBE,0xEF, 0,0,0,15, 0,0, 1, 0x05, 0,1, 0,0, 2,
        ][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_incomplete_header_is_not_an_error() {
        let mut parser = InboundParser::new(MAX, 1024);
        let mut buf = BytesMut::from(&[0xBE, 0xEF, 0, 0][..]);
        assert!(parser.parse(&mut buf).unwrap().is_empty());
        assert_eq!(buf.len(), 4);
    }
}
