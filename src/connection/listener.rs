use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::conversation::Conversation;
use crate::connection::physical::PhysicalConnection;
use crate::dispatch::dispatcher::DispatchStrategy;
use crate::error::MqError;
use crate::wire::framer::Transmission;

/// Application code attached to a conversation, receiving everything the peer sends on it
///  except replies to this side's exchanges
#[async_trait]
pub trait ReceiveListener: Send + Sync + 'static {
    async fn data_received(&self, transmission: Transmission, conversation: Conversation);

    /// Called exactly once per conversation when its connection fails
    fn error_occurred(&self, error: MqError, conversation: Conversation);

    /// The affinity hook: where the dispatcher runs `data_received` for this transmission. The
    ///  default keeps all of a conversation's traffic in order on one queue.
    fn dispatch_strategy(&self, _transmission: &Transmission, conversation: &Conversation) -> DispatchStrategy {
        DispatchStrategy::Affinity(conversation.dispatch_key())
    }
}

/// Notified about the fate of a single `send`
#[cfg_attr(test, automock)]
pub trait SendListener: Send + Sync + 'static {
    fn data_sent(&self, conversation_id: u16);
    /// the transmission was discarded by throttling, or the connection failed before it was
    ///  written
    fn error_occurred(&self, error: MqError, conversation_id: u16);
}

/// Provides receive listeners for conversations that a peer opens on an inbound connection
pub trait AcceptListener: Send + Sync + 'static {
    fn accept_conversation(&self, conversation: &Conversation) -> Arc<dyn ReceiveListener>;
}

pub trait ConnectionListener: Send + Sync + 'static {
    /// the connection's last conversation was closed
    fn connection_idle(&self, _connection: &Arc<PhysicalConnection>) {}

    /// the connection is gone; `error` is `None` for an orderly close
    fn connection_closed(&self, connection_id: u64, error: Option<&MqError>);
}
