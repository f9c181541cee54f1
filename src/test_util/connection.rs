use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::warn;

use crate::config::ChannelConfig;
use crate::connection::conversation::Conversation;
use crate::connection::listener::{AcceptListener, ReceiveListener};
use crate::connection::physical::{ConnectionRole, PhysicalConnection};
use crate::connection::socket::FrameSink;
use crate::connection::tracker::{ByteStream, Connector};
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{ErrorKind, MqError};
use crate::wire::framer::Transmission;
use crate::wire::parser::InboundParser;
use crate::wire::segment_type::SegmentType;

/// small frames, so that tests exercise segmentation
pub fn test_channel_config() -> ChannelConfig {
    let mut config = ChannelConfig::new();
    config.max_transmission_size = 256;
    config.max_message_size = 1024*1024;
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerBehavior {
    Record,
    /// reply to every transmission with a RECEIVE carrying the same payload
    Echo,
    /// reply to every transmission with an exception
    Fail(ErrorKind),
    /// close the conversation from inside the listener
    Close,
}

/// A receive listener for tests that records everything it is given
pub struct RecordingReceiveListener {
    behavior: Mutex<ListenerBehavior>,
    received: Mutex<Vec<Transmission>>,
    errors: Mutex<Vec<MqError>>,
}

impl RecordingReceiveListener {
    pub fn new(behavior: ListenerBehavior) -> Arc<RecordingReceiveListener> {
        Arc::new(RecordingReceiveListener {
            behavior: Mutex::new(behavior),
            received: Default::default(),
            errors: Default::default(),
        })
    }

    pub fn set_behavior(&self, behavior: ListenerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn received(&self) -> Vec<Transmission> {
        self.received.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<MqError> {
        self.errors.lock().unwrap().clone()
    }

    pub async fn wait_for_received(&self, n: usize) {
        let result = timeout(Duration::from_secs(5), async {
            while self.received.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await;
        assert!(result.is_ok(), "expected {} received transmissions, got {}", n, self.received.lock().unwrap().len());
    }
}

#[async_trait]
impl ReceiveListener for RecordingReceiveListener {
    async fn data_received(&self, transmission: Transmission, conversation: Conversation) {
        self.received.lock().unwrap().push(transmission.clone());

        let behavior = *self.behavior.lock().unwrap();
        let result = match behavior {
            ListenerBehavior::Record => Ok(()),
            ListenerBehavior::Echo => conversation.reply(&transmission, SegmentType::RECEIVE, transmission.payload.clone()).await,
            ListenerBehavior::Fail(kind) => conversation.reply_with_error(&transmission, &MqError::new(kind, "requested failure")).await,
            ListenerBehavior::Close => {
                conversation.close().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("test listener could not reply: {}", e);
        }
    }

    fn error_occurred(&self, error: MqError, _conversation: Conversation) {
        self.errors.lock().unwrap().push(error);
    }
}

/// Hands the same listener to every accepted conversation
pub struct SharedListenerAcceptor(pub Arc<RecordingReceiveListener>);

impl AcceptListener for SharedListenerAcceptor {
    fn accept_conversation(&self, _conversation: &Conversation) -> Arc<dyn ReceiveListener> {
        self.0.clone()
    }
}

pub struct ConnectionPair {
    pub client: Arc<PhysicalConnection>,
    pub server: Arc<PhysicalConnection>,
    pub server_listener: Arc<RecordingReceiveListener>,
}

/// An outbound and an inbound connection talking to each other in memory
pub fn connection_pair(config: ChannelConfig) -> ConnectionPair {
    let config = Arc::new(config);
    let dispatcher = Dispatcher::new(Handle::current(), 8);
    let (client_end, server_end) = tokio::io::duplex(64*1024);

    let server_listener = RecordingReceiveListener::new(ListenerBehavior::Record);
    let acceptor = Arc::new(SharedListenerAcceptor(server_listener.clone()));

    let client = PhysicalConnection::from_stream(client_end, ConnectionRole::Outbound, Some("test:1".to_string()), config.clone(), dispatcher.clone(), None);
    let server = PhysicalConnection::from_stream(server_end, ConnectionRole::Inbound, None, config, dispatcher, Some(acceptor));
    ConnectionPair { client, server, server_listener }
}

/// Connects to in-memory peers: every connect creates a fresh inbound connection that echoes
///  whatever it receives
pub struct DuplexConnector {
    config: Arc<ChannelConfig>,
    dispatcher: Dispatcher,
    num_connects: AtomicUsize,
    server_listener: Arc<RecordingReceiveListener>,
    servers: Mutex<Vec<Arc<PhysicalConnection>>>,
}

impl DuplexConnector {
    pub fn new(config: Arc<ChannelConfig>, dispatcher: Dispatcher) -> DuplexConnector {
        DuplexConnector {
            config,
            dispatcher,
            num_connects: AtomicUsize::new(0),
            server_listener: RecordingReceiveListener::new(ListenerBehavior::Echo),
            servers: Default::default(),
        }
    }

    pub fn num_connects(&self) -> usize {
        self.num_connects.load(Ordering::SeqCst)
    }

    pub fn server_listener(&self) -> &Arc<RecordingReceiveListener> {
        &self.server_listener
    }

    pub fn servers(&self) -> Vec<Arc<PhysicalConnection>> {
        self.servers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _endpoint: &str) -> anyhow::Result<Box<dyn ByteStream>> {
        self.num_connects.fetch_add(1, Ordering::SeqCst);
        let (client_end, server_end) = tokio::io::duplex(64*1024);
        let acceptor = Arc::new(SharedListenerAcceptor(self.server_listener.clone()));
        let server = PhysicalConnection::from_stream(server_end, ConnectionRole::Inbound, None, self.config.clone(), self.dispatcher.clone(), Some(acceptor));
        self.servers.lock().unwrap().push(server);
        Ok(Box::new(client_end))
    }
}

/// Collects written frames in memory
#[derive(Default)]
pub struct RecordingFrameSink {
    written: Mutex<BytesMut>,
}

impl RecordingFrameSink {
    /// Parses everything written so far
    pub fn transmissions(&self) -> Vec<Transmission> {
        let mut buf = self.written.lock().unwrap().clone();
        let mut parser = InboundParser::new(u32::MAX, u64::MAX);
        parser.parse(&mut buf).unwrap_or_default()
    }

    pub async fn wait_for_transmissions(&self, n: usize) -> Vec<Transmission> {
        let result = timeout(Duration::from_secs(5), async {
            loop {
                let transmissions = self.transmissions();
                if transmissions.len() >= n {
                    return transmissions;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await;
        match result {
            Ok(transmissions) => transmissions,
            Err(_) => panic!("expected {} transmissions, got {}", n, self.transmissions().len()),
        }
    }
}

#[async_trait]
impl FrameSink for RecordingFrameSink {
    async fn write_frames(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }

    async fn shutdown(&self) {}
}
