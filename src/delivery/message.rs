use std::fmt::{Debug, Formatter};

use bytes::Bytes;

/// Identifies a message within its destination. Handles are assigned in arrival order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(pub u64);

impl Debug for MessageHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageHandle({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub handle: MessageHandle,
    pub payload: Bytes,
    /// number of times the message was unlocked and made available again
    pub redelivery_count: u32,
}
