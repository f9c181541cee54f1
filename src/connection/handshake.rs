use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::wire::framer::Framer;

bitflags! {
    /// Optional protocol features. The negotiated set is the intersection of both sides' sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const TRANSACTIONS = 0x0001;
        const XA_TRANSACTIONS = 0x0002;
        const ORDERING_CONTEXT = 0x0004;
        const STOPPABLE_CONSUMERS = 0x0008;
        const BIFURCATED_SESSIONS = 0x0010;
        const DURABLE_SUBSCRIPTIONS = 0x0020;
        const PING = 0x0040;
    }
}

/// The names under which a peer is known in its deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub cell: String,
    pub node: String,
    pub server: String,
    pub cluster: String,
}

/// What each side tells the other during the handshake, and after negotiation the values that
///  both sides use for the rest of the connection's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeProperties {
    pub product_version: u16,
    pub protocol_level: u16,
    pub max_message_size: u64,
    pub max_transmission_size: u32,
    /// zero disables heartbeats
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub capabilities: Capabilities,
    pub topology: Topology,
}

const FIELD_PRODUCT_VERSION: u16 = 0x0001;
const FIELD_PROTOCOL_LEVEL: u16 = 0x0002;
const FIELD_MAX_MESSAGE_SIZE: u16 = 0x0003;
const FIELD_MAX_TRANSMISSION_SIZE: u16 = 0x0004;
const FIELD_HEARTBEAT_INTERVAL: u16 = 0x0005;
const FIELD_CAPABILITIES: u16 = 0x0007;
const FIELD_HEARTBEAT_TIMEOUT: u16 = 0x000D;
const FIELD_CELL_NAME: u16 = 0x000F;
const FIELD_NODE_NAME: u16 = 0x0010;
const FIELD_SERVER_NAME: u16 = 0x0011;
const FIELD_CLUSTER_NAME: u16 = 0x0012;

impl HandshakeProperties {
    pub fn from_config(config: &ChannelConfig) -> HandshakeProperties {
        HandshakeProperties {
            product_version: config.product_version,
            protocol_level: config.protocol_level,
            max_message_size: config.max_message_size,
            max_transmission_size: config.max_transmission_size,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            capabilities: config.capabilities,
            topology: config.topology.clone(),
        }
    }

    /// Combines our properties with the peer's. The operation is symmetric, so both sides
    ///  arrive at the same values.
    pub fn negotiate(&self, peer: &HandshakeProperties) -> HandshakeProperties {
        HandshakeProperties {
            product_version: self.product_version.min(peer.product_version),
            protocol_level: self.protocol_level.min(peer.protocol_level),
            max_message_size: self.max_message_size.min(peer.max_message_size),
            max_transmission_size: self.max_transmission_size.min(peer.max_transmission_size),
            heartbeat_interval: self.heartbeat_interval.min(peer.heartbeat_interval),
            heartbeat_timeout: self.heartbeat_timeout.max(peer.heartbeat_timeout),
            capabilities: self.capabilities & peer.capabilities,
            topology: peer.topology.clone(),
        }
    }

    /// TLV list: field id (u16), value length (u16), value
    pub fn ser(&self, buf: &mut BytesMut) {
        Self::put_field(buf, FIELD_PRODUCT_VERSION, &self.product_version.to_be_bytes());
        Self::put_field(buf, FIELD_PROTOCOL_LEVEL, &self.protocol_level.to_be_bytes());
        Self::put_field(buf, FIELD_MAX_MESSAGE_SIZE, &self.max_message_size.to_be_bytes());
        Self::put_field(buf, FIELD_MAX_TRANSMISSION_SIZE, &self.max_transmission_size.to_be_bytes());
        Self::put_field(buf, FIELD_HEARTBEAT_INTERVAL, &Self::secs(self.heartbeat_interval).to_be_bytes());
        Self::put_field(buf, FIELD_CAPABILITIES, &self.capabilities.bits().to_be_bytes());
        Self::put_field(buf, FIELD_HEARTBEAT_TIMEOUT, &Self::secs(self.heartbeat_timeout).to_be_bytes());
        Self::put_field(buf, FIELD_CELL_NAME, self.topology.cell.as_bytes());
        Self::put_field(buf, FIELD_NODE_NAME, self.topology.node.as_bytes());
        Self::put_field(buf, FIELD_SERVER_NAME, self.topology.server.as_bytes());
        Self::put_field(buf, FIELD_CLUSTER_NAME, self.topology.cluster.as_bytes());
    }

    fn secs(d: Duration) -> u16 {
        d.as_secs().min(u16::MAX as u64) as u16
    }

    fn put_field(buf: &mut BytesMut, id: u16, value: &[u8]) {
        buf.put_u16(id);
        buf.put_u16(value.len() as u16);
        buf.put_slice(value);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeProperties> {
        let mut product_version = None;
        let mut protocol_level = None;
        let mut max_message_size = None;
        let mut max_transmission_size = None;
        let mut heartbeat_interval = None;
        let mut heartbeat_timeout = None;
        let mut capabilities = Capabilities::empty();
        let mut topology = Topology::default();

        while buf.has_remaining() {
            let id = buf.try_get_u16()?;
            let len = buf.try_get_u16()? as usize;
            if buf.remaining() < len {
                bail!("handshake field {:#06x} is truncated: {} of {} bytes", id, buf.remaining(), len);
            }
            let mut value = buf.copy_to_bytes(len);

            match id {
                FIELD_PRODUCT_VERSION => product_version = Some(value.try_get_u16()?),
                FIELD_PROTOCOL_LEVEL => protocol_level = Some(value.try_get_u16()?),
                FIELD_MAX_MESSAGE_SIZE => max_message_size = Some(value.try_get_u64()?),
                FIELD_MAX_TRANSMISSION_SIZE => max_transmission_size = Some(value.try_get_u32()?),
                FIELD_HEARTBEAT_INTERVAL => heartbeat_interval = Some(Duration::from_secs(value.try_get_u16()? as u64)),
                FIELD_HEARTBEAT_TIMEOUT => heartbeat_timeout = Some(Duration::from_secs(value.try_get_u16()? as u64)),
                FIELD_CAPABILITIES => capabilities = Capabilities::from_bits_truncate(value.try_get_u32()?),
                FIELD_CELL_NAME => topology.cell = String::from_utf8_lossy(&value).into_owned(),
                FIELD_NODE_NAME => topology.node = String::from_utf8_lossy(&value).into_owned(),
                FIELD_SERVER_NAME => topology.server = String::from_utf8_lossy(&value).into_owned(),
                FIELD_CLUSTER_NAME => topology.cluster = String::from_utf8_lossy(&value).into_owned(),
                other => debug!("skipping unknown handshake field {:#06x}", other),
            }
        }

        let (Some(product_version), Some(protocol_level)) = (product_version, protocol_level) else {
            bail!("handshake without product version or protocol level");
        };
        let (Some(max_message_size), Some(max_transmission_size)) = (max_message_size, max_transmission_size) else {
            bail!("handshake without size limits");
        };
        if max_transmission_size < Framer::MIN_MAX_TRANSMISSION_SIZE {
            bail!("peer max transmission size {} is below the minimum of {}", max_transmission_size, Framer::MIN_MAX_TRANSMISSION_SIZE);
        }

        Ok(HandshakeProperties {
            product_version,
            protocol_level,
            max_message_size,
            max_transmission_size,
            heartbeat_interval: heartbeat_interval.unwrap_or_default(),
            heartbeat_timeout: heartbeat_timeout.unwrap_or(crate::config::DEFAULT_HEARTBEAT_TIMEOUT),
            capabilities,
            topology,
        })
    }
}

#[derive(Debug, Clone)]
pub enum GateState {
    Pending,
    Complete(HandshakeProperties),
    Failed(MqError),
}

/// Conversations other than the first one wait here until the first conversation's handshake
///  has a result. Once signalled, the state never changes again.
pub struct HandshakeGate {
    state: watch::Sender<GateState>,
}

impl HandshakeGate {
    pub fn new() -> HandshakeGate {
        let (state, _) = watch::channel(GateState::Pending);
        HandshakeGate { state }
    }

    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn negotiated(&self) -> Option<HandshakeProperties> {
        match &*self.state.borrow() {
            GateState::Complete(props) => Some(props.clone()),
            _ => None,
        }
    }

    pub fn signal_complete(&self, props: HandshakeProperties) -> bool {
        self.signal(GateState::Complete(props))
    }

    pub fn signal_failed(&self, error: MqError) -> bool {
        self.signal(GateState::Failed(error))
    }

    fn signal(&self, new_state: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, GateState::Pending) {
                *state = new_state;
                true
            }
            else {
                warn!("handshake gate was already signalled - ignoring {:?}", new_state);
                false
            }
        })
    }

    pub async fn wait(&self) -> MqResult<HandshakeProperties> {
        let mut receiver = self.state.subscribe();
        let result = receiver.wait_for(|s| !matches!(s, GateState::Pending)).await;
        match result.as_deref() {
            Ok(GateState::Complete(props)) => Ok(props.clone()),
            Ok(GateState::Failed(e)) => Err(MqError::new(ErrorKind::ConnectionUnavailable, format!("handshake failed: {}", e.context))),
            _ => Err(MqError::new(ErrorKind::ConnectionUnavailable, "handshake gate dropped")),
        }
    }
}

impl Default for HandshakeGate {
    fn default() -> Self {
        HandshakeGate::new()
    }
}
