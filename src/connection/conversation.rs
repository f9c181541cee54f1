use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connection::listener::{ReceiveListener, SendListener};
use crate::connection::physical::PhysicalConnection;
use crate::connection::request_table::{RequestCorrelation, RequestTable};
use crate::connection::send_queue::ThrottlingPolicy;
use crate::dispatch::dispatcher::DispatchKey;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::wire::framer::Transmission;
use crate::wire::headers::TransmissionFlags;
use crate::wire::priority::{Priority, RequestedPriority};
use crate::wire::segment_type::SegmentType;

tokio::task_local! {
    /// (connection id, conversation id) of the receive listener invocation running on the
    ///  current task
    pub(crate) static LISTENER_SCOPE: (u64, u16);
}

const CLOSE_REQUEST: u8 = 0;
const CLOSE_RESPONSE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// waiting for the connection's handshake
    Pending,
    Open,
    /// our logical close was sent, waiting for the peer's acknowledgement
    Closing,
    Closed,
}

struct ConversationCore {
    state: ConversationState,
    requests: RequestTable,
    close_waiters: Vec<oneshot::Sender<()>>,
    next_request_number: u16,
    error_delivered: bool,
}

struct ConversationInner {
    id: u16,
    is_first: bool,
    connection: Arc<PhysicalConnection>,
    core: Mutex<ConversationCore>,
    listener: Mutex<Option<Arc<dyn ReceiveListener>>>,
    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// A logical, ordered, bidirectional stream of transmissions multiplexed over a physical
///  connection. This is a cheap handle, clones refer to the same conversation.
#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

impl Debug for Conversation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.inner.id)
            .field("connection", &self.inner.connection.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Conversation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Conversation {
    pub(crate) fn new(id: u16, connection: Arc<PhysicalConnection>, is_first: bool, state: ConversationState, listener: Option<Arc<dyn ReceiveListener>>) -> Conversation {
        Conversation {
            inner: Arc::new(ConversationInner {
                id,
                is_first,
                connection,
                core: Mutex::new(ConversationCore {
                    state,
                    requests: Default::default(),
                    close_waiters: Vec::new(),
                    next_request_number: 1,
                    error_delivered: false,
                }),
                listener: Mutex::new(listener),
                attachment: Default::default(),
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// The first conversation of a connection carries the handshake
    pub fn is_first(&self) -> bool {
        self.inner.is_first
    }

    pub fn state(&self) -> ConversationState {
        self.inner.core.lock().unwrap().state
    }

    pub fn connection(&self) -> &Arc<PhysicalConnection> {
        &self.inner.connection
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey::Conversation {
            connection_id: self.inner.connection.id(),
            conversation_id: self.inner.id,
        }
    }

    pub fn receive_listener(&self) -> Option<Arc<dyn ReceiveListener>> {
        self.inner.listener.lock().unwrap().clone()
    }

    pub fn set_receive_listener(&self, listener: Arc<dyn ReceiveListener>) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    pub fn attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.attachment.lock().unwrap().clone()
    }

    pub fn set_attachment(&self, attachment: Arc<dyn Any + Send + Sync>) {
        *self.inner.attachment.lock().unwrap() = Some(attachment);
    }

    pub fn num_outstanding_requests(&self) -> usize {
        self.inner.core.lock().unwrap().requests.len()
    }

    /// A request number that is not currently outstanding on this conversation
    pub fn allocate_request_number(&self) -> u16 {
        let mut core = self.inner.core.lock().unwrap();
        loop {
            let candidate = core.next_request_number;
            core.next_request_number = match candidate.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !core.requests.contains(candidate) {
                return candidate;
            }
        }
    }

    /// Queues a transmission without waiting for a reply. Apart from throttling with
    ///  [ThrottlingPolicy::BlockThread], this returns as soon as the transmission is queued.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(&self,
                      payload: Bytes,
                      segment_type: SegmentType,
                      request_number: u16,
                      priority: RequestedPriority,
                      can_pool: bool,
                      throttling: ThrottlingPolicy,
                      send_listener: Option<Arc<dyn SendListener>>,
    ) -> MqResult<()> {
        self.check_open()?;
        if throttling == ThrottlingPolicy::DoNotThrottle {
            return Err(MqError::incorrect_call("DoNotThrottle is reserved for the connection's own flows"));
        }
        self.check_sendable(segment_type, payload.len())?;

        let priority = self.resolve_priority(priority);
        let transmission = self.transmission(segment_type, request_number, priority, Self::flags(can_pool, false), payload);
        trace!(conversation_id = self.id(), "sending {:?} with request number {}", segment_type, request_number);
        self.inner.connection.queue().enqueue(transmission, send_listener, throttling).await?;
        Ok(())
    }

    /// Sends a request and waits for the reply with the same request number. The wait ends with
    ///  an error if the conversation or its connection fails first, it never hangs.
    pub async fn exchange(&self, payload: Bytes, segment_type: SegmentType, request_number: u16, priority: RequestedPriority, can_pool: bool) -> MqResult<Transmission> {
        self.check_open()?;
        if request_number == 0 {
            return Err(MqError::incorrect_call("request number 0 cannot be used for an exchange"));
        }
        self.check_sendable(segment_type, payload.len())?;
        let priority = self.resolve_priority(priority);

        let reply = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state != ConversationState::Open {
                return Err(MqError::connection_dropped(format!("conversation {} is not open", self.id())));
            }
            core.requests.register(RequestCorrelation { request_number, priority, segment_type })?
        };

        let transmission = self.transmission(segment_type, request_number, priority, Self::flags(can_pool, true), payload);
        trace!(conversation_id = self.id(), "exchange {:?} with request number {}", segment_type, request_number);
        if let Err(e) = self.inner.connection.queue().enqueue(transmission, None, ThrottlingPolicy::BlockThread).await {
            self.inner.core.lock().unwrap().requests.remove(request_number);
            return Err(e);
        }

        Self::await_reply(reply).await
    }

    async fn await_reply(reply: oneshot::Receiver<MqResult<Transmission>>) -> MqResult<Transmission> {
        match reply.await {
            Ok(Ok(reply)) if reply.segment_type == SegmentType::EXCEPTION => {
                let mut payload = reply.payload.clone();
                Err(MqError::deser(&mut payload)
                    .unwrap_or_else(|e| MqError::new(ErrorKind::Resource, format!("malformed exception reply: {}", e))))
            }
            Ok(result) => result,
            Err(_) => Err(MqError::connection_lost("the conversation went away while waiting for a reply")),
        }
    }

    /// Answers a request received on this conversation, at the request's priority
    pub async fn reply(&self, request: &Transmission, segment_type: SegmentType, payload: Bytes) -> MqResult<()> {
        self.send(payload, segment_type, request.request_number, RequestedPriority::Level(request.priority.value()), false, ThrottlingPolicy::BlockThread, None).await
    }

    /// Answers a request with an error, which the requester's `exchange` returns
    pub async fn reply_with_error(&self, request: &Transmission, error: &MqError) -> MqResult<()> {
        let mut buf = BytesMut::new();
        error.ser(&mut buf);
        self.reply(request, SegmentType::EXCEPTION, buf.freeze()).await
    }

    /// Measures the round trip time to the peer
    pub async fn ping(&self, data: &[u8]) -> MqResult<Duration> {
        self.check_open()?;
        let request_number = self.allocate_request_number();
        let reply = self.inner.core.lock().unwrap()
            .requests.register(RequestCorrelation { request_number, priority: Priority::PING, segment_type: SegmentType::PING })?;

        let ping_time = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut payload = BytesMut::with_capacity(12 + data.len());
        payload.put_u64(ping_time);
        payload.put_u32(data.len() as u32);
        payload.put_slice(data);

        let started = Instant::now();
        let transmission = self.transmission(SegmentType::PING, request_number, Priority::PING, TransmissionFlags::EXCHANGE, payload.freeze());
        if let Err(e) = self.inner.connection.queue().enqueue_internal(transmission) {
            self.inner.core.lock().unwrap().requests.remove(request_number);
            return Err(e);
        }

        Self::await_reply(reply).await?;
        Ok(started.elapsed())
    }

    /// Closes the conversation with a logical close flow, waiting for the peer to acknowledge
    ///  it. When called from inside this conversation's receive listener, the conversation is
    ///  closed immediately without waiting, since the acknowledgement could only be delivered
    ///  after the listener returns.
    pub async fn close(&self) {
        let connection_id = self.inner.connection.id();
        let in_listener = LISTENER_SCOPE
            .try_with(|scope| *scope == (connection_id, self.id()))
            .unwrap_or(false);

        let (send_flow, waiter) = {
            let mut core = self.inner.core.lock().unwrap();
            match core.state {
                ConversationState::Closed => return,
                ConversationState::Pending => (false, None),
                ConversationState::Closing => (false, Some(Self::add_close_waiter(&mut core))),
                ConversationState::Open => {
                    core.state = ConversationState::Closing;
                    (true, Some(Self::add_close_waiter(&mut core)))
                }
            }
        };

        if waiter.is_none() {
            debug!(conversation_id = self.id(), "closing conversation before it was opened");
            self.mark_closed(MqError::connection_dropped("conversation closed before it was opened"));
            return;
        }

        if send_flow {
            debug!(conversation_id = self.id(), "sending logical close");
            let flow = self.close_flow(CLOSE_REQUEST);
            if let Err(e) = self.inner.connection.queue().enqueue_internal(flow) {
                self.mark_closed(e);
                return;
            }
        }

        if in_listener {
            debug!(conversation_id = self.id(), "close called from the receive listener - not waiting for the peer");
            self.mark_closed(MqError::connection_dropped("conversation was closed"));
            return;
        }

        if let Some(waiter) = waiter {
            // the sender is dropped if the connection fails, which means closed just as well
            let _ = waiter.await;
        }
    }

    fn add_close_waiter(core: &mut ConversationCore) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        core.close_waiters.push(tx);
        rx
    }

    /// Closes the conversation locally without telling the peer. Pending exchanges fail with
    ///  a connection-lost error.
    pub fn fast_close(&self) {
        debug!(conversation_id = self.id(), "fast close");
        self.mark_closed(MqError::connection_lost("conversation was closed"));
    }

    fn mark_closed(&self, error: MqError) {
        let waiters = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state == ConversationState::Closed {
                return;
            }
            core.state = ConversationState::Closed;
            core.requests.fail_all(&error);
            std::mem::take(&mut core.close_waiters)
        };
        // the connection is updated before anybody waiting for the close returns
        self.inner.connection.remove_conversation(self.id());
        for waiter in waiters {
            let _ = waiter.send(());
        }
        debug!(conversation_id = self.id(), "conversation closed");
    }

    /// Called by the connection when it is invalidated. The listener is told exactly once.
    pub(crate) fn on_connection_invalidated(&self, error: &MqError) {
        let (waiters, deliver) = {
            let mut core = self.inner.core.lock().unwrap();
            core.state = ConversationState::Closed;
            core.requests.fail_all(error);
            let deliver = !core.error_delivered;
            core.error_delivered = true;
            (std::mem::take(&mut core.close_waiters), deliver)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        if deliver {
            if let Some(listener) = self.receive_listener() {
                listener.error_occurred(error.clone(), self.clone());
            }
        }
    }

    /// Waits for the connection's handshake and moves from `Pending` to `Open`
    pub(crate) async fn wait_until_open(&self) -> MqResult<()> {
        match self.inner.connection.gate().wait().await {
            Ok(_) => {
                let mut core = self.inner.core.lock().unwrap();
                match core.state {
                    ConversationState::Pending => {
                        core.state = ConversationState::Open;
                        Ok(())
                    }
                    ConversationState::Open => Ok(()),
                    _ => Err(MqError::connection_dropped("conversation was closed while waiting for the handshake")),
                }
            }
            Err(e) => {
                self.mark_closed(e.clone());
                Err(e)
            }
        }
    }

    /// Handles an inbound transmission for this conversation. Replies to our own exchanges and
    ///  control flows are handled here, everything else is returned for the receive listener.
    pub(crate) fn on_transmission(&self, transmission: Transmission) -> Option<(Arc<dyn ReceiveListener>, Transmission)> {
        match transmission.segment_type {
            SegmentType::LOGICAL_CLOSE => {
                self.on_logical_close(&transmission);
                return None;
            }
            SegmentType::PING => {
                let response = self.transmission(SegmentType::PING_RESPONSE, transmission.request_number, Priority::PING, TransmissionFlags::empty(), transmission.payload);
                if let Err(e) = self.inner.connection.queue().enqueue_internal(response) {
                    debug!(conversation_id = self.id(), "cannot answer ping: {}", e);
                }
                return None;
            }
            SegmentType::PING_RESPONSE => {
                if !self.inner.core.lock().unwrap().requests.complete(transmission.request_number, Ok(transmission)) {
                    debug!(conversation_id = self.id(), "ping response without a ping - ignoring");
                }
                return None;
            }
            _ => {}
        }

        if !transmission.is_exchange() && transmission.request_number != 0 {
            let mut core = self.inner.core.lock().unwrap();
            if core.requests.contains(transmission.request_number) {
                let request_number = transmission.request_number;
                core.requests.complete(request_number, Ok(transmission));
                return None;
            }
        }

        if self.state() == ConversationState::Closed {
            debug!(conversation_id = self.id(), "{:?} for a closed conversation - ignoring", transmission.segment_type);
            return None;
        }

        match self.receive_listener() {
            Some(listener) => Some((listener, transmission)),
            None => {
                warn!(conversation_id = self.id(), "no receive listener - dropping {:?}", transmission.segment_type);
                None
            }
        }
    }

    fn on_logical_close(&self, transmission: &Transmission) {
        match transmission.payload.first().copied() {
            Some(CLOSE_REQUEST) => {
                if let Err(e) = self.inner.connection.queue().enqueue_internal(self.close_flow(CLOSE_RESPONSE)) {
                    debug!(conversation_id = self.id(), "cannot acknowledge logical close: {}", e);
                }
                match self.state() {
                    ConversationState::Closing => debug!(conversation_id = self.id(), "parallel close - waiting for the peer's acknowledgement"),
                    ConversationState::Closed => {}
                    _ => {
                        debug!(conversation_id = self.id(), "closed by peer");
                        self.mark_closed(MqError::connection_dropped("conversation was closed by the peer"));
                    }
                }
            }
            Some(CLOSE_RESPONSE) => {
                if self.state() == ConversationState::Closing {
                    self.mark_closed(MqError::connection_dropped("conversation was closed"));
                }
                else {
                    debug!(conversation_id = self.id(), "unsolicited logical close acknowledgement - ignoring");
                }
            }
            other => warn!(conversation_id = self.id(), "logical close with unexpected payload {:?} - ignoring", other),
        }
    }

    fn check_open(&self) -> MqResult<()> {
        match self.state() {
            ConversationState::Open => Ok(()),
            state => Err(MqError::connection_dropped(format!("conversation {} is {:?}", self.id(), state))),
        }
    }

    fn check_sendable(&self, segment_type: SegmentType, len: usize) -> MqResult<()> {
        if segment_type.is_channel_internal() || !segment_type.is_segmentable() {
            return Err(MqError::incorrect_call(format!("{:?} is reserved for the connection", segment_type)));
        }
        let max_message_size = self.inner.connection.max_message_size();
        if len as u64 > max_message_size {
            return Err(MqError::new(ErrorKind::LimitExceeded, format!("{} bytes exceed the max message size of {}", len, max_message_size)));
        }
        Ok(())
    }

    fn resolve_priority(&self, requested: RequestedPriority) -> Priority {
        requested.capped_level()
            .unwrap_or_else(|| {
                self.inner.connection.queue()
                    .lowest_queued_priority(self.id())
                    .unwrap_or(Priority::LOWEST)
            })
    }

    fn flags(can_pool: bool, exchange: bool) -> TransmissionFlags {
        let mut flags = TransmissionFlags::empty();
        flags.set(TransmissionFlags::POOLED, can_pool);
        flags.set(TransmissionFlags::EXCHANGE, exchange);
        flags
    }

    fn close_flow(&self, kind: u8) -> Transmission {
        self.transmission(SegmentType::LOGICAL_CLOSE, 0, Priority::LOGICAL_CLOSE, TransmissionFlags::empty(), Bytes::copy_from_slice(&[kind]))
    }

    fn transmission(&self, segment_type: SegmentType, request_number: u16, priority: Priority, flags: TransmissionFlags, payload: Bytes) -> Transmission {
        Transmission {
            segment_type,
            conversation_id: self.id(),
            request_number,
            priority,
            flags,
            payload,
        }
    }
}
