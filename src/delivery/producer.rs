use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::delivery::destination::Destination;
use crate::delivery::message::SessionId;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::ordering::OrderingContext;
use crate::transaction::Transaction;

pub struct ProducerSession {
    id: SessionId,
    destination: Arc<Destination>,
    ordering_context: Option<Arc<OrderingContext>>,
    closed: AtomicBool,
}

impl ProducerSession {
    pub(crate) fn new(id: SessionId, destination: Arc<Destination>, ordering_context: Option<Arc<OrderingContext>>) -> ProducerSession {
        ProducerSession {
            id,
            destination,
            ordering_context,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Without a transaction the message is visible to consumers right away, with a
    ///  transaction it becomes visible on commit
    pub fn send(&self, payload: Bytes, tran: Option<&Transaction>) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::new(ErrorKind::SessionUnavailable, "the producer session is closed"));
        }

        let _ordering_guard = self.ordering_context.as_ref().map(|o| o.enter());
        match tran {
            Some(tran) => tran.send(&self.destination, payload),
            None => {
                let handle = self.destination.put(payload)?;
                trace!("{:?} sent {:?} to {}", self.id, handle, self.destination.name());
                Ok(())
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
