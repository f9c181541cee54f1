use std::fmt::{Debug, Formatter};

use anyhow::bail;

/// The shape of a frame on the wire, determined by its segment type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// primary header only - connection-scoped flows
    PrimaryOnly,
    /// primary header + conversation header
    Conversation,
    /// primary header + conversation header + segment start header
    SegmentStart,
    SegmentMiddle,
    SegmentEnd,
}

/// Type of a transmission. The values 0x01-0x05, 0x0A, 0x0E, 0x0F and 0xFF are reserved for the
///  channel itself, the constants from 0x10 up are session / connection flows. Any other value
///  is a framing error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentType(pub u8);

impl SegmentType {
    pub const HEARTBEAT: SegmentType = SegmentType(0x01);
    pub const HEARTBEAT_RESPONSE: SegmentType = SegmentType(0x02);
    pub const SEGMENTED_START: SegmentType = SegmentType(0x03);
    pub const SEGMENTED_MIDDLE: SegmentType = SegmentType(0x04);
    pub const SEGMENTED_END: SegmentType = SegmentType(0x05);
    pub const LOGICAL_CLOSE: SegmentType = SegmentType(0x0A);
    pub const PING: SegmentType = SegmentType(0x0E);
    pub const PING_RESPONSE: SegmentType = SegmentType(0x0F);
    pub const PHYSICAL_CLOSE: SegmentType = SegmentType(0xFF);

    pub const HANDSHAKE: SegmentType = SegmentType(0x10);
    pub const HANDSHAKE_RESPONSE: SegmentType = SegmentType(0x11);
    pub const EXCEPTION: SegmentType = SegmentType(0x12);

    pub const CONNECTION_OPEN: SegmentType = SegmentType(0x20);
    pub const CONNECTION_CLOSE: SegmentType = SegmentType(0x21);
    pub const SESSION_CREATE: SegmentType = SegmentType(0x22);
    pub const SESSION_CLOSE: SegmentType = SegmentType(0x23);

    pub const SEND: SegmentType = SegmentType(0x30);
    pub const RECEIVE: SegmentType = SegmentType(0x31);
    pub const REGISTER_ASYNC_CONSUMER: SegmentType = SegmentType(0x32);
    pub const DEREGISTER_ASYNC_CONSUMER: SegmentType = SegmentType(0x33);
    pub const SESSION_START: SegmentType = SegmentType(0x34);
    pub const SESSION_STOP: SegmentType = SegmentType(0x35);
    pub const DELETE_SET: SegmentType = SegmentType(0x36);
    pub const UNLOCK_SET: SegmentType = SegmentType(0x37);

    pub const TRANSACTION_COMMIT: SegmentType = SegmentType(0x40);
    pub const TRANSACTION_ROLLBACK: SegmentType = SegmentType(0x41);

    pub const DURABLE_SUB_CREATE: SegmentType = SegmentType(0x50);
    pub const DURABLE_SUB_DELETE: SegmentType = SegmentType(0x51);

    const APPLICATION: [SegmentType; 19] = [
        Self::HANDSHAKE, Self::HANDSHAKE_RESPONSE, Self::EXCEPTION,
        Self::CONNECTION_OPEN, Self::CONNECTION_CLOSE, Self::SESSION_CREATE, Self::SESSION_CLOSE,
        Self::SEND, Self::RECEIVE, Self::REGISTER_ASYNC_CONSUMER, Self::DEREGISTER_ASYNC_CONSUMER,
        Self::SESSION_START, Self::SESSION_STOP, Self::DELETE_SET, Self::UNLOCK_SET,
        Self::TRANSACTION_COMMIT, Self::TRANSACTION_ROLLBACK,
        Self::DURABLE_SUB_CREATE, Self::DURABLE_SUB_DELETE,
    ];

    pub fn is_channel_internal(self) -> bool {
        matches!(self.0, 0x01..=0x05 | 0x0A | 0x0E | 0x0F | 0xFF)
    }

    /// false for values without a defined meaning, including unassigned values in the
    ///  reserved range
    pub fn is_known(self) -> bool {
        matches!(self, Self::HEARTBEAT | Self::HEARTBEAT_RESPONSE
            | Self::SEGMENTED_START | Self::SEGMENTED_MIDDLE | Self::SEGMENTED_END
            | Self::LOGICAL_CLOSE | Self::PING | Self::PING_RESPONSE | Self::PHYSICAL_CLOSE)
            || Self::APPLICATION.contains(&self)
    }

    pub fn frame_layout(self) -> anyhow::Result<FrameLayout> {
        match self {
            Self::HEARTBEAT | Self::HEARTBEAT_RESPONSE | Self::PHYSICAL_CLOSE => Ok(FrameLayout::PrimaryOnly),
            Self::SEGMENTED_START => Ok(FrameLayout::SegmentStart),
            Self::SEGMENTED_MIDDLE => Ok(FrameLayout::SegmentMiddle),
            Self::SEGMENTED_END => Ok(FrameLayout::SegmentEnd),
            t if t.is_known() => Ok(FrameLayout::Conversation),
            t => bail!("unknown segment type {:?}", t),
        }
    }

    /// Segment types that can be carried inside a segmented flow, i.e. conversation-scoped
    ///  types other than the segmentation markers themselves
    pub fn is_segmentable(self) -> bool {
        matches!(self.frame_layout(), Ok(FrameLayout::Conversation))
    }
}

impl Debug for SegmentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentType(0x{:02X})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SegmentType::HEARTBEAT, true, Some(FrameLayout::PrimaryOnly))]
    #[case(SegmentType::HEARTBEAT_RESPONSE, true, Some(FrameLayout::PrimaryOnly))]
    #[case(SegmentType::SEGMENTED_START, true, Some(FrameLayout::SegmentStart))]
    #[case(SegmentType::SEGMENTED_MIDDLE, true, Some(FrameLayout::SegmentMiddle))]
    #[case(SegmentType::SEGMENTED_END, true, Some(FrameLayout::SegmentEnd))]
    #[case(SegmentType::LOGICAL_CLOSE, true, Some(FrameLayout::Conversation))]
    #[case(SegmentType::PING, true, Some(FrameLayout::Conversation))]
    #[case(SegmentType::PING_RESPONSE, true, Some(FrameLayout::Conversation))]
    #[case(SegmentType::PHYSICAL_CLOSE, true, Some(FrameLayout::PrimaryOnly))]
    #[case(SegmentType::SEND, false, Some(FrameLayout::Conversation))]
    #[case(SegmentType::DURABLE_SUB_DELETE, false, Some(FrameLayout::Conversation))]
    #[case(SegmentType(0x06), false, None)]
    #[case(SegmentType(0x0D), false, None)]
    #[case(SegmentType(0x13), false, None)]
    #[case(SegmentType(0x60), false, None)]
    #[case(SegmentType(0x00), false, None)]
    fn test_classification(#[case] segment_type: SegmentType, #[case] internal: bool, #[case] layout: Option<FrameLayout>) {
        assert_eq!(segment_type.is_channel_internal(), internal);
        assert_eq!(segment_type.frame_layout().ok(), layout);
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", SegmentType::PHYSICAL_CLOSE), "SegmentType(0xFF)");
    }
}
