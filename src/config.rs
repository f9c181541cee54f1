use std::time::Duration;

use anyhow::bail;

use crate::connection::handshake::{Capabilities, Topology};
use crate::wire::framer::Framer;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_MAX_TRANSMISSION_SIZE: u32 = 1024*1024;
pub const DEFAULT_CONVERSATIONS_PER_SOCKET: usize = 5;

/// Settings for the wire layer, shared by all physical connections of a context.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// A heartbeat is sent on a connection when nothing was received on it for this long.
    pub heartbeat_interval: Duration,
    /// The time a peer has to answer a heartbeat before the connection is considered broken
    pub heartbeat_timeout: Duration,
    /// granularity of the heartbeat timer
    pub heartbeat_check_interval: Duration,

    /// Upper bound for a single frame on the wire, including all headers. Larger payloads are
    ///  segmented.
    pub max_transmission_size: u32,
    /// Upper bound for a reassembled payload
    pub max_message_size: u64,

    /// Once a socket carries this many conversations, the tracker connects a new socket
    pub conversations_per_socket: usize,
    /// Connections without conversations that are kept open for reuse, per endpoint
    pub max_idle_connections: usize,

    /// Bytes that may be queued for writing on a connection before throttling kicks in
    pub max_queued_bytes: usize,

    pub protocol_level: u16,
    pub product_version: u16,
    pub capabilities: Capabilities,
    pub topology: Topology,
}

impl ChannelConfig {
    pub fn new() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_check_interval: Duration::from_secs(1),
            max_transmission_size: DEFAULT_MAX_TRANSMISSION_SIZE,
            max_message_size: 100*1024*1024,
            conversations_per_socket: DEFAULT_CONVERSATIONS_PER_SOCKET,
            max_idle_connections: 1,
            max_queued_bytes: 8*1024*1024,
            protocol_level: 20,
            product_version: 1,
            capabilities: Capabilities::all(),
            topology: Topology::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transmission_size < Framer::MIN_MAX_TRANSMISSION_SIZE {
            bail!("max transmission size must be at least {} bytes", Framer::MIN_MAX_TRANSMISSION_SIZE);
        }
        if self.heartbeat_timeout.is_zero() {
            bail!("heartbeat timeout must not be zero");
        }
        if self.heartbeat_check_interval.is_zero() {
            bail!("heartbeat check interval must not be zero");
        }
        if self.conversations_per_socket == 0 || self.conversations_per_socket > u16::MAX as usize {
            bail!("conversations per socket must be between 1 and {}", u16::MAX);
        }
        if self.max_queued_bytes == 0 {
            bail!("max queued bytes must not be zero");
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    /// maximum number of messages in the destination, including locked ones; 0 for unbounded
    pub max_depth: usize,
    /// After this many failed deliveries a message is moved to the exception list
    pub max_failed_deliveries: u32,
    /// Without an exception list, messages stay in the destination however often they fail
    pub exception_list: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig {
            max_depth: 0,
            max_failed_deliveries: 5,
            exception_list: true,
        }
    }
}

/// Settings for the delivery layer
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// upper bound for units of work the dispatcher runs concurrently
    pub dispatcher_max_workers: usize,
    /// granularity of the background task that expires message locks and re-exposes hidden
    ///  messages
    pub lock_expiry_check_interval: Duration,
    pub default_destination_config: DestinationConfig,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        DeliveryConfig {
            dispatcher_max_workers: 16,
            lock_expiry_check_interval: Duration::from_millis(100),
            default_destination_config: DestinationConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatcher_max_workers == 0 {
            bail!("the dispatcher needs at least one worker");
        }
        if self.lock_expiry_check_interval.is_zero() {
            bail!("lock expiry check interval must not be zero");
        }
        if self.default_destination_config.max_failed_deliveries == 0 {
            bail!("max failed deliveries must be at least 1");
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig::new()
    }
}
