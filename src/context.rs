use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ChannelConfig, DeliveryConfig, DestinationConfig};
use crate::connection::conversation::Conversation;
use crate::connection::listener::ReceiveListener;
use crate::connection::tracker::{ConnectionTracker, Connector};
use crate::delivery::bifurcated::BifurcatedConsumerSession;
use crate::delivery::browser::BrowserSession;
use crate::delivery::consumer::ConsumerSession;
use crate::delivery::destination::{Destination, DestinationRegistry};
use crate::delivery::exception::{AsyncExceptionListener, ExceptionListeners};
use crate::delivery::lock_expiry::run_lock_expiry_loop;
use crate::delivery::message::SessionId;
use crate::delivery::producer::ProducerSession;
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::ordering::OrderingContext;
use crate::transaction::{UncoordinatedTransaction, XaResource};

/// Owns everything: the dispatcher, the connection tracker, destinations and sessions, and the
///  background lock expiry task. Nothing outlives [MessagingContext::close].
pub struct MessagingContext {
    dispatcher: Dispatcher,
    tracker: Arc<ConnectionTracker>,
    destinations: Arc<DestinationRegistry>,
    exception_listeners: Arc<ExceptionListeners>,
    /// sessions, transactions and ordering contexts
    next_id: AtomicU64,
    consumers: Mutex<Vec<ConsumerSession>>,
    bifurcated: Mutex<Vec<Arc<BifurcatedConsumerSession>>>,
    producers: Mutex<Vec<Arc<ProducerSession>>>,
    browsers: Mutex<Vec<Arc<BrowserSession>>>,
    lock_expiry: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MessagingContext {
    /// Must be called from inside a tokio runtime, which runs all of the context's tasks
    pub fn new(channel_config: ChannelConfig, delivery_config: DeliveryConfig, connector: Arc<dyn Connector>) -> anyhow::Result<MessagingContext> {
        channel_config.validate()?;
        delivery_config.validate()?;

        let runtime = Handle::current();
        let dispatcher = Dispatcher::new(runtime.clone(), delivery_config.dispatcher_max_workers);
        let tracker = Arc::new(ConnectionTracker::new(Arc::new(channel_config), dispatcher.clone(), connector));
        let destinations = Arc::new(DestinationRegistry::new(delivery_config.default_destination_config.clone()));

        let lock_expiry = runtime.spawn(run_lock_expiry_loop(Arc::downgrade(&destinations), delivery_config.lock_expiry_check_interval));

        info!("messaging context created");
        Ok(MessagingContext {
            dispatcher,
            tracker,
            destinations,
            exception_listeners: Default::default(),
            next_id: AtomicU64::new(1),
            consumers: Default::default(),
            bifurcated: Default::default(),
            producers: Default::default(),
            browsers: Default::default(),
            lock_expiry: Mutex::new(Some(lock_expiry)),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::new(ErrorKind::ConnectionDropped, "the messaging context is closed"));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Opens a conversation to `endpoint`, reusing a pooled connection if there is one
    pub async fn connect(&self, endpoint: &str, listener: Arc<dyn ReceiveListener>) -> MqResult<Conversation> {
        self.check_open()?;
        self.tracker.connect(endpoint, listener).await
    }

    pub fn add_exception_listener(&self, listener: Arc<dyn AsyncExceptionListener>) {
        self.exception_listeners.add(listener);
    }

    pub fn create_destination(&self, name: &str, config: Option<DestinationConfig>) -> MqResult<Arc<Destination>> {
        self.check_open()?;
        self.destinations.create(name, config)
    }

    pub fn destination(&self, name: &str) -> MqResult<Arc<Destination>> {
        self.destinations.get(name)
    }

    pub fn create_consumer_session(&self, destination: &str) -> MqResult<ConsumerSession> {
        self.check_open()?;
        let destination = self.destinations.get(destination)?;
        let session = ConsumerSession::new(SessionId(self.next_id()), destination, self.dispatcher.clone(), self.exception_listeners.clone());
        debug!("created consumer session {:?}", session.id());
        self.consumers.lock().unwrap().push(session.clone());
        Ok(session)
    }

    pub fn create_bifurcated_consumer_session(&self, primary: &ConsumerSession) -> MqResult<Arc<BifurcatedConsumerSession>> {
        self.check_open()?;
        let session = Arc::new(BifurcatedConsumerSession::new(SessionId(self.next_id()), primary.clone())?);
        self.bifurcated.lock().unwrap().push(session.clone());
        Ok(session)
    }

    pub fn create_browser_session(&self, destination: &str) -> MqResult<Arc<BrowserSession>> {
        self.check_open()?;
        let destination = self.destinations.get(destination)?;
        let session = Arc::new(BrowserSession::new(SessionId(self.next_id()), destination));
        self.browsers.lock().unwrap().push(session.clone());
        Ok(session)
    }

    pub fn create_producer_session(&self, destination: &str, ordering_context: Option<Arc<OrderingContext>>) -> MqResult<Arc<ProducerSession>> {
        self.check_open()?;
        let destination = self.destinations.get(destination)?;
        let session = Arc::new(ProducerSession::new(SessionId(self.next_id()), destination, ordering_context));
        self.producers.lock().unwrap().push(session.clone());
        Ok(session)
    }

    pub fn create_ordering_context(&self) -> Arc<OrderingContext> {
        Arc::new(OrderingContext::new(self.next_id()))
    }

    pub fn create_uncoordinated_transaction(&self) -> MqResult<UncoordinatedTransaction> {
        self.check_open()?;
        Ok(UncoordinatedTransaction::new(self.next_id()))
    }

    pub fn create_xa_resource(&self) -> MqResult<XaResource> {
        self.check_open()?;
        Ok(XaResource::new(self.next_id()))
    }

    /// Closes all sessions (unlocking their messages), drops every connection and stops the
    ///  background tasks. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing messaging context");

        for session in self.bifurcated.lock().unwrap().drain(..) {
            let _ = session.close();
        }
        for session in self.consumers.lock().unwrap().drain(..) {
            let _ = session.close();
        }
        for session in self.producers.lock().unwrap().drain(..) {
            session.close();
        }
        for session in self.browsers.lock().unwrap().drain(..) {
            session.close();
        }

        self.tracker.close_idle();
        self.tracker.invalidate_all(true, MqError::connection_dropped("the messaging context was closed"));

        if let Some(task) = self.lock_expiry.lock().unwrap().take() {
            task.abort();
        }
    }
}
