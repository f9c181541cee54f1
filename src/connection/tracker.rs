use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::ChannelConfig;
use crate::connection::conversation::Conversation;
use crate::connection::listener::{AcceptListener, ConnectionListener, ReceiveListener};
use crate::connection::physical::{ConnectionRole, PhysicalConnection};
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{ErrorKind, MqError, MqResult};

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

/// Opens byte streams to endpoints. The transport below the framing layer (plain TCP, TLS,
///  tunnels) is the connector's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Box<dyn ByteStream>>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Default)]
struct RegistryState {
    /// inbound connections and outbound connections with conversations
    active: FxHashMap<u64, Arc<PhysicalConnection>>,
    /// outbound connections without conversations, kept for reuse
    idle: FxHashMap<String, Vec<Arc<PhysicalConnection>>>,
}

struct Registry {
    state: Mutex<RegistryState>,
    connect_locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_idle_connections: usize,
}

impl Registry {
    fn connect_lock(&self, endpoint: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_locks.lock().unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    /// Starts a conversation on an existing connection to the endpoint, preferring connections
    ///  in use over pooled ones
    fn begin_on_existing(&self, endpoint: &str, listener: &Arc<dyn ReceiveListener>) -> Option<Conversation> {
        let mut state = self.state.lock().unwrap();

        let mut candidates = state.active.values()
            .filter(|c| c.role() == ConnectionRole::Outbound && c.endpoint() == Some(endpoint) && !c.is_invalidated())
            .cloned()
            .collect::<Vec<_>>();
        candidates.sort_by_key(|c| c.id());
        for connection in candidates {
            match connection.begin_conversation(listener.clone()) {
                Ok(conversation) => return Some(conversation),
                Err(e) => debug!("connection {} cannot take another conversation: {}", connection.id(), e),
            }
        }

        while let Some(connection) = state.idle.get_mut(endpoint).and_then(|pool| pool.pop()) {
            if connection.is_invalidated() {
                continue;
            }
            debug!("reusing pooled connection {} to {}", connection.id(), endpoint);
            state.active.insert(connection.id(), connection.clone());
            match connection.begin_conversation(listener.clone()) {
                Ok(conversation) => return Some(conversation),
                Err(e) => debug!("pooled connection {} is unusable: {}", connection.id(), e),
            }
        }
        None
    }
}

impl ConnectionListener for Registry {
    fn connection_idle(&self, connection: &Arc<PhysicalConnection>) {
        let Some(endpoint) = connection.endpoint() else {
            return;
        };
        if connection.role() != ConnectionRole::Outbound {
            return;
        }

        let pooled = {
            let mut state = self.state.lock().unwrap();
            // a conversation may have been started on it in the meantime
            if connection.num_conversations() > 0 || state.active.remove(&connection.id()).is_none() {
                return;
            }

            let pool = state.idle.entry(endpoint.to_string()).or_default();
            if pool.len() < self.max_idle_connections {
                pool.push(connection.clone());
                true
            }
            else {
                false
            }
        };

        if pooled {
            debug!("connection {} to {} is idle - pooling it", connection.id(), endpoint);
        }
        else {
            debug!("connection {} to {} is idle and the pool is full - closing it", connection.id(), endpoint);
            connection.close();
        }
    }

    fn connection_closed(&self, connection_id: u64, error: Option<&MqError>) {
        debug!("connection {} is gone: {:?}", connection_id, error);
        let mut state = self.state.lock().unwrap();
        state.active.remove(&connection_id);
        for pool in state.idle.values_mut() {
            pool.retain(|c| c.id() != connection_id);
        }
    }
}

/// Registry of a context's physical connections. Conversations to an endpoint share a socket
///  until it carries `conversations_per_socket` of them, and sockets without conversations are
///  pooled for reuse up to `max_idle_connections` per endpoint.
pub struct ConnectionTracker {
    config: Arc<ChannelConfig>,
    dispatcher: Dispatcher,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
}

impl ConnectionTracker {
    pub fn new(config: Arc<ChannelConfig>, dispatcher: Dispatcher, connector: Arc<dyn Connector>) -> ConnectionTracker {
        let registry = Arc::new(Registry {
            state: Default::default(),
            connect_locks: Default::default(),
            max_idle_connections: config.max_idle_connections,
        });
        ConnectionTracker {
            config,
            dispatcher,
            connector,
            registry,
        }
    }

    /// Opens a conversation to an endpoint, on an existing connection if one has room
    pub async fn connect(&self, endpoint: &str, listener: Arc<dyn ReceiveListener>) -> MqResult<Conversation> {
        let conversation = {
            let connect_lock = self.registry.connect_lock(endpoint);
            let _guard = connect_lock.lock().await;

            match self.registry.begin_on_existing(endpoint, &listener) {
                Some(conversation) => conversation,
                None => {
                    debug!("opening a new connection to {}", endpoint);
                    let stream = self.connector.connect(endpoint).await
                        .map_err(|e| MqError::new(ErrorKind::ConnectionUnavailable, format!("cannot connect to {}: {}", endpoint, e)))?;
                    let connection = PhysicalConnection::from_stream(stream, ConnectionRole::Outbound, Some(endpoint.to_string()), self.config.clone(), self.dispatcher.clone(), None);
                    connection.add_connection_listener(self.registry.clone());

                    let mut state = self.registry.state.lock().unwrap();
                    state.active.insert(connection.id(), connection.clone());
                    connection.begin_conversation(listener)?
                }
            }
        };

        let connection = conversation.connection().clone();
        connection.complete_opening(&conversation).await?;
        Ok(conversation)
    }

    /// Registers a connection that a peer opened to us
    pub fn accept<S: AsyncRead + AsyncWrite + Send + 'static>(&self, stream: S, accept_listener: Arc<dyn AcceptListener>) -> Arc<PhysicalConnection> {
        let connection = PhysicalConnection::from_stream(stream, ConnectionRole::Inbound, None, self.config.clone(), self.dispatcher.clone(), Some(accept_listener));
        connection.add_connection_listener(self.registry.clone());
        self.registry.state.lock().unwrap()
            .active.insert(connection.id(), connection.clone());
        debug!("accepted connection {}", connection.id());
        connection
    }

    /// Accepts TCP connections until the listener fails
    pub async fn run_acceptor(&self, listener: TcpListener, accept_listener: Arc<dyn AcceptListener>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("connection from {:?}", peer_addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("cannot set TCP_NODELAY: {}", e);
                    }
                    self.accept(stream, accept_listener.clone());
                }
                Err(e) => {
                    error!("error accepting connections: {}", e);
                    break;
                }
            }
        }
    }

    pub fn connections(&self) -> Vec<Arc<PhysicalConnection>> {
        let state = self.registry.state.lock().unwrap();
        state.active.values()
            .chain(state.idle.values().flatten())
            .cloned()
            .collect()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.connections().iter()
            .flat_map(|c| c.conversations())
            .collect()
    }

    pub fn find_connection(&self, connection_id: u64) -> Option<Arc<PhysicalConnection>> {
        self.connections().into_iter()
            .find(|c| c.id() == connection_id)
    }

    pub fn num_idle(&self) -> usize {
        self.registry.state.lock().unwrap()
            .idle.values()
            .map(|pool| pool.len())
            .sum()
    }

    /// Closes all pooled connections
    pub fn close_idle(&self) {
        let idle = std::mem::take(&mut self.registry.state.lock().unwrap().idle);
        for connection in idle.into_values().flatten() {
            connection.close();
        }
    }

    pub fn invalidate_all(&self, notify_peer: bool, error: MqError) {
        let connections = self.connections();
        info!("invalidating {} connections: {}", connections.len(), error);
        for connection in connections {
            connection.invalidate(notify_peer, error.clone());
        }
    }
}
