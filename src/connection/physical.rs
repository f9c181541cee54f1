use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::connection::conversation::{Conversation, ConversationState, LISTENER_SCOPE};
use crate::connection::handshake::{GateState, HandshakeGate, HandshakeProperties};
use crate::connection::heartbeat::{run_heartbeat_loop, HeartbeatAction, HeartbeatMonitor};
use crate::connection::listener::{AcceptListener, ConnectionListener, ReceiveListener};
use crate::connection::send_queue::OutboundQueue;
use crate::connection::socket::{FrameSink, StreamSink};
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::wire::framer::{Framer, Transmission};
use crate::wire::headers::TransmissionFlags;
use crate::wire::parser::InboundParser;
use crate::wire::priority::{Priority, RequestedPriority};
use crate::wire::segment_type::SegmentType;

const READ_BUFFER_SIZE: usize = 64*1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// we connected to the peer; only outbound connections create conversations
    Outbound,
    /// the peer connected to us; conversations are accepted when the peer first uses their id
    Inbound,
}

struct ConnectionState {
    conversations: FxHashMap<u16, Conversation>,
    used_ids: BitSet,
    first_conversation_created: bool,
}

#[derive(Default)]
struct Tasks {
    read_loop: Option<JoinHandle<()>>,
    heartbeat_loop: Option<JoinHandle<()>>,
}

/// One socket with all conversations multiplexed over it.
///
/// Outbound data goes through a priority queue drained by a single writer task, which assigns
///  packet numbers. Inbound data is parsed by a read loop that completes exchanges directly and
///  hands everything else to the dispatcher.
pub struct PhysicalConnection {
    id: u64,
    role: ConnectionRole,
    endpoint: Option<String>,
    config: Arc<ChannelConfig>,
    dispatcher: Dispatcher,
    sink: Arc<dyn FrameSink>,
    queue: OutboundQueue,
    state: Mutex<ConnectionState>,
    gate: HandshakeGate,
    max_transmission_size: AtomicU32,
    max_message_size: AtomicU64,
    heartbeat: Mutex<HeartbeatMonitor>,
    invalidated: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    accept_listener: Option<Arc<dyn AcceptListener>>,
    tasks: Mutex<Tasks>,
    myself: Weak<PhysicalConnection>,
}

impl PhysicalConnection {
    /// Creates a connection without starting its I/O, see [PhysicalConnection::start]
    pub fn new(role: ConnectionRole,
               endpoint: Option<String>,
               config: Arc<ChannelConfig>,
               dispatcher: Dispatcher,
               sink: Arc<dyn FrameSink>,
               accept_listener: Option<Arc<dyn AcceptListener>>,
    ) -> Arc<PhysicalConnection> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("creating {:?} connection {} to {:?}", role, id, endpoint);

        Arc::new_cyclic(|myself| PhysicalConnection {
            id,
            role,
            endpoint,
            dispatcher,
            sink,
            queue: OutboundQueue::new(config.max_queued_bytes),
            state: Mutex::new(ConnectionState {
                conversations: Default::default(),
                used_ids: BitSet::new(),
                first_conversation_created: false,
            }),
            gate: HandshakeGate::new(),
            max_transmission_size: AtomicU32::new(config.max_transmission_size),
            max_message_size: AtomicU64::new(config.max_message_size),
            heartbeat: Mutex::new(HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeat_timeout, Instant::now())),
            invalidated: AtomicBool::new(false),
            listeners: Default::default(),
            accept_listener,
            tasks: Default::default(),
            myself: myself.clone(),
            config,
        })
    }

    /// Convenience for creating and starting a connection on a byte stream
    pub fn from_stream<S: AsyncRead + AsyncWrite + Send + 'static>(stream: S,
                                                                   role: ConnectionRole,
                                                                   endpoint: Option<String>,
                                                                   config: Arc<ChannelConfig>,
                                                                   dispatcher: Dispatcher,
                                                                   accept_listener: Option<Arc<dyn AcceptListener>>,
    ) -> Arc<PhysicalConnection> {
        let (reader, writer) = tokio::io::split(stream);
        let connection = Self::new(role, endpoint, config, dispatcher, Arc::new(StreamSink::new(writer)), accept_listener);
        connection.start(reader);
        connection
    }

    /// Spawns the read loop, the writer and the heartbeat timer
    pub fn start<R: AsyncRead + Unpin + Send + 'static>(self: &Arc<Self>, reader: R) {
        let read_loop = tokio::spawn(self.clone().read_loop(reader));
        tokio::spawn(self.clone().write_loop());
        let heartbeat_loop = tokio::spawn(run_heartbeat_loop(self.myself.clone(), self.config.heartbeat_check_interval));

        let mut tasks = self.tasks.lock().unwrap();
        tasks.read_loop = Some(read_loop);
        tasks.heartbeat_loop = Some(heartbeat_loop);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &HandshakeGate {
        &self.gate
    }

    pub fn negotiated(&self) -> Option<HandshakeProperties> {
        self.gate.negotiated()
    }

    pub fn max_message_size(&self) -> u64 {
        self.max_message_size.load(Ordering::Acquire)
    }

    pub(crate) fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn num_conversations(&self) -> usize {
        self.state.lock().unwrap().conversations.len()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().conversations.values().cloned().collect()
    }

    pub fn find_conversation(&self, conversation_id: u16) -> Option<Conversation> {
        self.state.lock().unwrap().conversations.get(&conversation_id).cloned()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.lock().unwrap().clone()
    }

    /// Registers a new conversation with the lowest free id. The first conversation of a
    ///  connection is open right away, later ones are `Pending` until the handshake completes.
    ///  The conversation becomes usable after [PhysicalConnection::complete_opening].
    pub fn begin_conversation(&self, listener: Arc<dyn ReceiveListener>) -> MqResult<Conversation> {
        if self.role == ConnectionRole::Inbound {
            return Err(MqError::incorrect_call("conversations are created by the connecting side only"));
        }
        if self.is_invalidated() {
            return Err(MqError::connection_dropped(format!("connection {} is closed", self.id)));
        }
        let Some(myself) = self.myself.upgrade() else {
            return Err(MqError::connection_dropped(format!("connection {} is closed", self.id)));
        };

        let mut state = self.state.lock().unwrap();
        if state.conversations.len() >= self.config.conversations_per_socket {
            return Err(MqError::new(ErrorKind::LimitExceeded, format!("connection {} has no free conversation slot", self.id)));
        }
        let Some(id) = (1..=u16::MAX).find(|id| !state.used_ids.contains(*id as usize)) else {
            return Err(MqError::new(ErrorKind::LimitExceeded, "no free conversation id"));
        };

        let is_first = !state.first_conversation_created;
        state.first_conversation_created = true;

        let initial_state = if is_first {
            ConversationState::Open
        }
        else {
            match self.gate.state() {
                GateState::Pending => ConversationState::Pending,
                GateState::Complete(_) => ConversationState::Open,
                GateState::Failed(e) => return Err(MqError::new(ErrorKind::ConnectionUnavailable, format!("handshake failed: {}", e.context))),
            }
        };

        let conversation = Conversation::new(id, myself, is_first, initial_state, Some(listener));
        state.used_ids.insert(id as usize);
        state.conversations.insert(id, conversation.clone());
        debug!(conversation_id = id, "new conversation on connection {} ({:?})", self.id, initial_state);
        Ok(conversation)
    }

    /// The first conversation performs the handshake, later ones wait for its outcome
    pub async fn complete_opening(&self, conversation: &Conversation) -> MqResult<()> {
        if conversation.is_first() {
            self.perform_handshake(conversation).await.map(|_| ())
        }
        else {
            conversation.wait_until_open().await
        }
    }

    pub async fn open_conversation(&self, listener: Arc<dyn ReceiveListener>) -> MqResult<Conversation> {
        let conversation = self.begin_conversation(listener)?;
        self.complete_opening(&conversation).await?;
        Ok(conversation)
    }

    async fn perform_handshake(&self, conversation: &Conversation) -> MqResult<HandshakeProperties> {
        let ours = HandshakeProperties::from_config(&self.config);
        let mut buf = BytesMut::new();
        ours.ser(&mut buf);

        debug!("handshake on connection {}", self.id);
        let request_number = conversation.allocate_request_number();
        let result = conversation.exchange(buf.freeze(), SegmentType::HANDSHAKE, request_number, RequestedPriority::Level(Priority::HIGHEST_USER.value()), false).await
            .and_then(|reply| {
                if reply.segment_type != SegmentType::HANDSHAKE_RESPONSE {
                    return Err(MqError::incorrect_call(format!("unexpected handshake reply {:?}", reply.segment_type)));
                }
                let mut payload = reply.payload.clone();
                Ok(HandshakeProperties::deser(&mut payload)?)
            });

        match result {
            Ok(peer) => {
                let negotiated = ours.negotiate(&peer);
                info!("connection {} established: {:?}", self.id, negotiated);
                self.apply_negotiated(&negotiated);
                self.gate.signal_complete(negotiated.clone());
                Ok(negotiated)
            }
            Err(e) => {
                let error = MqError::new(ErrorKind::ConnectionUnavailable, format!("handshake failed: {}", e));
                warn!("connection {}: {}", self.id, error);
                self.invalidate(true, error.clone());
                Err(error)
            }
        }
    }

    fn accept_handshake(&self, conversation: &Conversation, request: Transmission) {
        let mut payload = request.payload.clone();
        let peer = match HandshakeProperties::deser(&mut payload) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("malformed handshake on connection {}: {}", self.id, e);
                self.invalidate(true, MqError::new(ErrorKind::ConnectionUnavailable, format!("malformed handshake: {}", e)));
                return;
            }
        };

        let ours = HandshakeProperties::from_config(&self.config);
        let mut buf = BytesMut::new();
        ours.ser(&mut buf);
        let response = Transmission {
            segment_type: SegmentType::HANDSHAKE_RESPONSE,
            conversation_id: conversation.id(),
            request_number: request.request_number,
            priority: request.priority,
            flags: TransmissionFlags::empty(),
            payload: buf.freeze(),
        };
        if let Err(e) = self.queue.enqueue_internal(response) {
            debug!("cannot answer handshake on connection {}: {}", self.id, e);
            return;
        }

        let negotiated = ours.negotiate(&peer);
        info!("connection {} accepted: {:?}", self.id, negotiated);
        self.apply_negotiated(&negotiated);
        self.gate.signal_complete(negotiated);
    }

    fn apply_negotiated(&self, negotiated: &HandshakeProperties) {
        self.max_transmission_size.store(negotiated.max_transmission_size, Ordering::Release);
        self.max_message_size.store(negotiated.max_message_size, Ordering::Release);
        self.heartbeat.lock().unwrap()
            .set_timing(negotiated.heartbeat_interval, negotiated.heartbeat_timeout);
    }

    pub(crate) fn remove_conversation(&self, conversation_id: u16) {
        let now_idle = {
            let mut state = self.state.lock().unwrap();
            if state.conversations.remove(&conversation_id).is_none() {
                return;
            }
            state.used_ids.remove(conversation_id as usize);
            state.conversations.is_empty()
        };

        if now_idle && !self.is_invalidated() {
            debug!("connection {} has no conversations left", self.id);
            if let Some(myself) = self.myself.upgrade() {
                for listener in self.connection_listeners() {
                    listener.connection_idle(&myself);
                }
            }
        }
    }

    pub(crate) fn poll_heartbeat(&self, now: Instant) -> HeartbeatAction {
        self.heartbeat.lock().unwrap().poll(now)
    }

    pub(crate) fn send_heartbeat(&self) {
        let heartbeat = Transmission::connection_scoped(SegmentType::HEARTBEAT, Priority::HEARTBEAT, Bytes::new());
        if let Err(e) = self.queue.enqueue_internal(heartbeat) {
            debug!("cannot send heartbeat on connection {}: {}", self.id, e);
        }
    }

    /// Orderly shutdown of a connection without conversations: everything queued is still
    ///  written, followed by a physical close flow.
    pub fn close(&self) {
        self.shutdown(true, None);
    }

    /// Tears the connection down after a failure. Every blocked exchange is woken with `error`,
    ///  and every conversation's receive listener is told exactly once. Calling this more than
    ///  once has no effect.
    pub fn invalidate(&self, notify_peer: bool, error: MqError) {
        self.shutdown(notify_peer, Some(error));
    }

    fn shutdown(&self, notify_peer: bool, error: Option<MqError>) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            trace!("connection {} is already closed", self.id);
            return;
        }
        match &error {
            Some(e) => info!("invalidating connection {}: {}", self.id, e),
            None => debug!("closing connection {}", self.id),
        }

        let physical_close = notify_peer
            .then(|| Transmission::connection_scoped(SegmentType::PHYSICAL_CLOSE, Priority::HEARTBEAT, Bytes::new()));
        let conversation_error = error.clone()
            .unwrap_or_else(|| MqError::connection_dropped(format!("connection {} was closed", self.id)));

        for unsent in self.queue.close(physical_close, error.is_none()) {
            if let Some(listener) = unsent.send_listener {
                listener.error_occurred(conversation_error.clone(), unsent.transmission.conversation_id);
            }
        }

        if matches!(self.gate.state(), GateState::Pending) {
            self.gate.signal_failed(conversation_error.clone());
        }

        let conversations = {
            let mut state = self.state.lock().unwrap();
            state.used_ids.clear();
            state.conversations.drain()
                .map(|(_, c)| c)
                .collect::<Vec<_>>()
        };
        for conversation in conversations {
            conversation.on_connection_invalidated(&conversation_error);
        }

        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(read_loop) = tasks.read_loop.take() {
                read_loop.abort();
            }
            if let Some(heartbeat_loop) = tasks.heartbeat_loop.take() {
                heartbeat_loop.abort();
            }
        }

        for listener in self.connection_listeners() {
            listener.connection_closed(self.id, error.as_ref());
        }
    }

    async fn write_loop(self: Arc<Self>) {
        let mut framer = Framer::new(self.config.max_transmission_size);
        let mut buf = BytesMut::new();

        while let Some(item) = self.queue.next().await {
            framer.set_max_transmission_size(self.max_transmission_size.load(Ordering::Acquire));
            let conversation_id = item.transmission.conversation_id;

            buf.clear();
            if let Err(e) = framer.encode(&item.transmission, &mut buf) {
                warn!(conversation_id, "cannot encode {:?} on connection {}: {}", item.transmission.segment_type, self.id, e);
                if let Some(listener) = &item.send_listener {
                    listener.error_occurred(e.into(), conversation_id);
                }
                continue;
            }

            if let Err(e) = self.sink.write_frames(&buf).await {
                let error = MqError::connection_lost(format!("write failed: {}", e));
                if let Some(listener) = &item.send_listener {
                    listener.error_occurred(error.clone(), conversation_id);
                }
                self.invalidate(false, error);
                break;
            }
            if let Some(listener) = &item.send_listener {
                listener.data_sent(conversation_id);
            }
        }

        trace!("writer for connection {} is done", self.id);
        self.sink.shutdown().await;
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R) {
        let mut parser = InboundParser::new(self.config.max_transmission_size, self.config.max_message_size);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("connection {} was closed by the peer", self.id);
                    self.invalidate(false, MqError::connection_lost("the peer closed the socket"));
                    return;
                }
                Ok(n) => trace!("received {} bytes on connection {}", n, self.id),
                Err(e) => {
                    debug!("read failed on connection {}: {}", self.id, e);
                    self.invalidate(false, MqError::connection_lost(format!("read failed: {}", e)));
                    return;
                }
            }
            self.heartbeat.lock().unwrap().on_data_received(Instant::now());

            match parser.parse(&mut buf) {
                Ok(transmissions) => {
                    for transmission in transmissions {
                        self.on_transmission(transmission).await;
                    }
                }
                Err(e) => {
                    warn!("framing error on connection {}: {}", self.id, e);
                    self.invalidate(true, MqError::connection_lost(format!("framing error: {}", e)));
                    return;
                }
            }

            if self.is_invalidated() {
                return;
            }
        }
    }

    async fn on_transmission(self: &Arc<Self>, transmission: Transmission) {
        match transmission.segment_type {
            SegmentType::HEARTBEAT => {
                trace!("heartbeat on connection {}", self.id);
                let response = Transmission::connection_scoped(SegmentType::HEARTBEAT_RESPONSE, Priority::HEARTBEAT, Bytes::new());
                if let Err(e) = self.queue.enqueue_internal(response) {
                    debug!("cannot answer heartbeat on connection {}: {}", self.id, e);
                }
            }
            SegmentType::HEARTBEAT_RESPONSE => trace!("heartbeat response on connection {}", self.id),
            SegmentType::PHYSICAL_CLOSE => {
                debug!("physical close from peer on connection {}", self.id);
                self.invalidate(false, MqError::connection_lost("the peer closed the connection"));
            }
            _ => self.on_conversation_transmission(transmission).await,
        }
    }

    async fn on_conversation_transmission(self: &Arc<Self>, transmission: Transmission) {
        let conversation = match self.find_conversation(transmission.conversation_id) {
            Some(conversation) => conversation,
            None => match self.accept_conversation(&transmission) {
                Some(conversation) => conversation,
                None => return,
            }
        };

        if transmission.segment_type == SegmentType::HANDSHAKE && self.role == ConnectionRole::Inbound {
            self.accept_handshake(&conversation, transmission);
            return;
        }

        let Some((listener, transmission)) = conversation.on_transmission(transmission) else {
            return;
        };

        let strategy = listener.dispatch_strategy(&transmission, &conversation);
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "transmission_received", ?correlation_id, conversation_id = conversation.id());
        let scope = (self.id, conversation.id());

        let work = LISTENER_SCOPE.scope(scope, async move {
            listener.data_received(transmission, conversation).await;
        }).instrument(span);
        self.dispatcher.dispatch(strategy, Box::pin(work)).await;
    }

    fn accept_conversation(self: &Arc<Self>, transmission: &Transmission) -> Option<Conversation> {
        if self.role != ConnectionRole::Inbound
            || transmission.conversation_id == 0
            || transmission.segment_type == SegmentType::LOGICAL_CLOSE
            || transmission.segment_type == SegmentType::PING_RESPONSE
        {
            debug!(conversation_id = transmission.conversation_id, "{:?} for unknown conversation on connection {} - ignoring", transmission.segment_type, self.id);
            return None;
        }
        let Some(accept_listener) = &self.accept_listener else {
            warn!("connection {} has no accept listener - ignoring new conversation {}", self.id, transmission.conversation_id);
            return None;
        };

        let conversation = {
            let mut state = self.state.lock().unwrap();
            let is_first = !state.first_conversation_created;
            state.first_conversation_created = true;

            let conversation = Conversation::new(transmission.conversation_id, self.clone(), is_first, ConversationState::Open, None);
            state.used_ids.insert(transmission.conversation_id as usize);
            state.conversations.insert(transmission.conversation_id, conversation.clone());
            conversation
        };
        conversation.set_receive_listener(accept_listener.accept_conversation(&conversation));
        debug!(conversation_id = conversation.id(), "accepted conversation on connection {}", self.id);
        Some(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::runtime::Handle;
    use tokio::time::timeout;
    use crate::connection::listener::MockSendListener;
    use crate::connection::send_queue::ThrottlingPolicy;
    use crate::test_util::connection::{connection_pair, test_channel_config, ListenerBehavior, RecordingFrameSink, RecordingReceiveListener};

    fn payload(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    async fn send(conversation: &Conversation, data: &'static str) {
        conversation.send(payload(data), SegmentType::SEND, 0, RequestedPriority::Level(1), false, ThrottlingPolicy::BlockThread, None).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_and_send() {
        let pair = connection_pair(test_channel_config());
        let client_listener = RecordingReceiveListener::new(ListenerBehavior::Record);
        let conversation = pair.client.open_conversation(client_listener.clone()).await.unwrap();
        assert!(conversation.is_first());
        assert_eq!(conversation.state(), ConversationState::Open);

        let negotiated = pair.client.negotiated().unwrap();
        timeout(Duration::from_secs(5), pair.server.gate().wait()).await.unwrap().unwrap();
        assert_eq!(pair.server.negotiated().unwrap(), negotiated);

        send(&conversation, "hello").await;
        pair.server_listener.wait_for_received(1).await;
        let received = pair.server_listener.received();
        assert_eq!(received[0].payload, payload("hello"));
        assert_eq!(received[0].conversation_id, conversation.id());
        assert_eq!(pair.server.num_conversations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_rejects_tiny_peer_transmission_size() {
        let config = Arc::new(test_channel_config());
        let (client_end, mut peer_end) = tokio::io::duplex(64*1024);
        let client = PhysicalConnection::from_stream(client_end, ConnectionRole::Outbound, Some("test:1".to_string()), config.clone(), Dispatcher::new(Handle::current(), 2), None);

        // a hand-rolled peer that answers the handshake with a max transmission size no frame fits into
        let peer = tokio::spawn(async move {
            let mut parser = InboundParser::new(config.max_transmission_size, config.max_message_size);
            let mut buf = BytesMut::new();
            let request = loop {
                peer_end.read_buf(&mut buf).await.unwrap();
                if let Some(t) = parser.parse(&mut buf).unwrap().into_iter().next() {
                    break t;
                }
            };
            assert_eq!(request.segment_type, SegmentType::HANDSHAKE);

            let mut props = HandshakeProperties::from_config(&config);
            props.max_transmission_size = 20;
            let mut payload = BytesMut::new();
            props.ser(&mut payload);
            let response = Transmission {
                segment_type: SegmentType::HANDSHAKE_RESPONSE,
                conversation_id: request.conversation_id,
                request_number: request.request_number,
                priority: request.priority,
                flags: TransmissionFlags::empty(),
                payload: payload.freeze(),
            };
            let mut out = BytesMut::new();
            Framer::new(config.max_transmission_size).encode(&response, &mut out).unwrap();
            peer_end.write_all(&out).await.unwrap();
            peer_end
        });

        let err = timeout(Duration::from_secs(5), client.open_conversation(RecordingReceiveListener::new(ListenerBehavior::Record))).await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionUnavailable);
        assert!(client.is_invalidated());
        assert!(matches!(client.gate().state(), GateState::Failed(_)));
        assert!(client.negotiated().is_none());
        let _peer_end = peer.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_later_conversations_wait_for_handshake() {
        let pair = connection_pair(test_channel_config());
        let first = pair.client.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap();
        let second = pair.client.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap();
        assert_eq!(first.state(), ConversationState::Open);
        assert_eq!(second.state(), ConversationState::Pending);
        assert_eq!((first.id(), second.id()), (1, 2));

        // sending is not possible before the handshake
        let err = second.send(payload("x"), SegmentType::SEND, 0, RequestedPriority::Level(0), false, ThrottlingPolicy::BlockThread, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionDropped);

        let waiting = tokio::spawn({
            let client = pair.client.clone();
            let second = second.clone();
            async move { client.complete_opening(&second).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        pair.client.complete_opening(&first).await.unwrap();
        timeout(Duration::from_secs(5), waiting).await.unwrap().unwrap().unwrap();
        assert_eq!(second.state(), ConversationState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inbound_connection_cannot_create_conversations() {
        let pair = connection_pair(test_channel_config());
        let err = pair.server.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IncorrectCall);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_conversation_limit_and_lowest_free_id() {
        let mut config = test_channel_config();
        config.conversations_per_socket = 2;
        let pair = connection_pair(config);

        let first = pair.client.open_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).await.unwrap();
        let second = pair.client.open_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).await.unwrap();
        let err = pair.client.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LimitExceeded);

        first.fast_close();
        let third = pair.client.open_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).await.unwrap();
        assert_eq!(third.id(), 1);
        assert!(!third.is_first());
        assert_eq!(second.id(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_wakes_exchange_and_notifies_listeners() {
        let pair = connection_pair(test_channel_config());
        let listener_a = RecordingReceiveListener::new(ListenerBehavior::Record);
        let listener_b = RecordingReceiveListener::new(ListenerBehavior::Record);
        let a = pair.client.open_conversation(listener_a.clone()).await.unwrap();
        let b = pair.client.open_conversation(listener_b.clone()).await.unwrap();

        let blocked = tokio::spawn({
            let b = b.clone();
            async move { b.exchange(payload("never answered"), SegmentType::SEND, 1, RequestedPriority::Level(2), false).await }
        });
        pair.server_listener.wait_for_received(1).await;

        pair.client.invalidate(true, MqError::connection_lost("test"));
        pair.client.invalidate(true, MqError::connection_lost("again"));

        let err = timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionLost);
        assert_eq!(listener_a.errors().len(), 1);
        assert_eq!(listener_b.errors().len(), 1);
        assert_eq!(a.state(), ConversationState::Closed);
        assert_eq!(b.state(), ConversationState::Closed);

        let err = a.send(payload("x"), SegmentType::SEND, 0, RequestedPriority::Level(0), false, ThrottlingPolicy::BlockThread, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionDropped);

        // the peer sees the physical close
        timeout(Duration::from_secs(5), async {
            while !pair.server.is_invalidated() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();
        assert_eq!(pair.server_listener.errors().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_orders_by_priority() {
        let sink = Arc::new(RecordingFrameSink::default());
        let dispatcher = Dispatcher::new(Handle::current(), 4);
        let connection = PhysicalConnection::new(ConnectionRole::Outbound, None, Arc::new(test_channel_config()), dispatcher, sink.clone(), None);
        let conversation = connection.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap();

        for (request_number, priority) in [(1, 2), (2, 9), (3, 2), (4, 12)] {
            conversation.send(payload("x"), SegmentType::SEND, request_number, RequestedPriority::Level(priority), false, ThrottlingPolicy::BlockThread, None).await.unwrap();
        }
        // the lowest-outstanding sentinel does not overtake the queued priority 2 transmissions
        conversation.send(payload("x"), SegmentType::SEND, 5, RequestedPriority::LowestOutstanding, false, ThrottlingPolicy::BlockThread, None).await.unwrap();

        let (_keep_open, reader) = tokio::io::duplex(64);
        connection.start(reader);

        let transmissions = sink.wait_for_transmissions(5).await;
        let order = transmissions.iter().map(|t| t.request_number).collect::<Vec<_>>();
        assert_eq!(order, vec![4, 2, 1, 3, 5]);
    }

    #[tokio::test]
    async fn test_discarded_send_is_reported() {
        let mut config = test_channel_config();
        config.max_queued_bytes = 10;
        let dispatcher = Dispatcher::new(Handle::current(), 4);
        let connection = PhysicalConnection::new(ConnectionRole::Outbound, None, Arc::new(config), dispatcher, Arc::new(RecordingFrameSink::default()), None);
        let conversation = connection.begin_conversation(RecordingReceiveListener::new(ListenerBehavior::Record)).unwrap();

        conversation.send(Bytes::from(vec![0; 8]), SegmentType::SEND, 0, RequestedPriority::Level(0), false, ThrottlingPolicy::BlockThread, None).await.unwrap();

        let mut send_listener = MockSendListener::new();
        send_listener.expect_error_occurred()
            .withf(|e, _| e.kind == ErrorKind::LimitExceeded)
            .once()
            .return_const(());
        send_listener.expect_data_sent().never();
        conversation.send(Bytes::from(vec![0; 5]), SegmentType::SEND, 0, RequestedPriority::Level(0), false, ThrottlingPolicy::DiscardTransmission, Some(Arc::new(send_listener))).await.unwrap();
        assert_eq!(connection.queue().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_invalidates() {
        let mut config = test_channel_config();
        config.heartbeat_interval = Duration::from_secs(10);
        config.heartbeat_timeout = Duration::from_secs(3);
        config.heartbeat_check_interval = Duration::from_millis(500);

        // a peer that reads everything and never answers
        let (ours, mut theirs) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = theirs.read_to_end(&mut sink).await;
        });
        let dispatcher = Dispatcher::new(Handle::current(), 4);
        let connection = PhysicalConnection::from_stream(ours, ConnectionRole::Outbound, None, Arc::new(config), dispatcher, None);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!connection.is_invalidated());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(connection.is_invalidated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_answered_keeps_connection() {
        let mut config = test_channel_config();
        config.heartbeat_interval = Duration::from_secs(10);
        config.heartbeat_timeout = Duration::from_secs(3);
        config.heartbeat_check_interval = Duration::from_millis(500);
        let pair = connection_pair(config);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!pair.client.is_invalidated());
        assert!(!pair.server.is_invalidated());
    }
}
