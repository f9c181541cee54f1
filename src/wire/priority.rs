use anyhow::bail;
use tracing::warn;

/// Priority of a transmission on its connection. Higher values are written first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    /// highest priority available to callers
    pub const HIGHEST_USER: Priority = Priority(0x0C);
    pub const LOGICAL_CLOSE: Priority = Priority(0x0D);
    pub const PING: Priority = Priority(0x0E);
    pub const HEARTBEAT: Priority = Priority(0x0F);

    pub const NUM_LEVELS: usize = 16;

    /// for values decoded from the wire
    pub fn try_new(raw: u8) -> anyhow::Result<Priority> {
        if raw as usize >= Self::NUM_LEVELS {
            bail!("priority {} is out of range", raw);
        }
        Ok(Priority(raw))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The priority a caller asks for when sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedPriority {
    Level(u8),
    /// the lowest priority among the conversation's transmissions that are still queued, so
    ///  that this transmission does not overtake any of them
    LowestOutstanding,
}

impl RequestedPriority {
    /// Levels above the caller range are capped rather than rejected
    pub fn capped_level(self) -> Option<Priority> {
        match self {
            RequestedPriority::Level(l) if l > Priority::HIGHEST_USER.0 => {
                warn!("priority {} is outside the range of caller priorities - capping to {}", l, Priority::HIGHEST_USER.0);
                Some(Priority::HIGHEST_USER)
            }
            RequestedPriority::Level(l) => Some(Priority(l)),
            RequestedPriority::LowestOutstanding => None,
        }
    }
}

impl From<u8> for RequestedPriority {
    fn from(value: u8) -> Self {
        RequestedPriority::Level(value)
    }
}
