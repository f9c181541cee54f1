use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::delivery::consumer::ConsumerSession;
use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::error::{ErrorKind, MqError, MqResult};
use crate::transaction::Transaction;

/// Acts on messages locked to another consumer session. Reading a message adopts its lock:
///  from then on, only the bifurcated session can delete or unlock it.
pub struct BifurcatedConsumerSession {
    id: SessionId,
    primary: ConsumerSession,
    closed: AtomicBool,
}

impl BifurcatedConsumerSession {
    pub(crate) fn new(id: SessionId, primary: ConsumerSession) -> MqResult<BifurcatedConsumerSession> {
        if primary.is_closed() {
            return Err(MqError::new(ErrorKind::SessionUnavailable, "the primary consumer session is closed"));
        }
        Ok(BifurcatedConsumerSession {
            id,
            primary,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn primary_session_id(&self) -> SessionId {
        self.primary.id()
    }

    fn check_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) || self.primary.is_closed() {
            return Err(MqError::new(ErrorKind::SessionUnavailable, "the bifurcated consumer session is closed"));
        }
        Ok(())
    }

    fn adopt(&self, handle: MessageHandle) -> MqResult<Message> {
        let destination = self.primary.destination();
        if destination.is_locked_to(handle, self.id) {
            return destination.message(handle)
                .ok_or_else(|| MqError::not_locked(handle));
        }
        let message = destination.transfer(handle, self.primary.id(), self.id)?;
        self.primary.core().forget_retained(&[handle]);
        debug!("{:?} adopted {:?} from {:?}", self.id, handle, self.primary.id());
        Ok(message)
    }

    /// Applies `f` to each handle in order, stopping at the first failure
    fn for_each<T>(&self, handles: &[MessageHandle], mut f: impl FnMut(MessageHandle) -> MqResult<T>) -> MqResult<Vec<T>> {
        self.check_open()?;
        let mut succeeded = Vec::new();
        let mut results = Vec::new();
        for handle in handles {
            match f(*handle) {
                Ok(r) => {
                    succeeded.push(*handle);
                    results.push(r);
                }
                Err(e) => return Err(e.with_succeeded(succeeded)),
            }
        }
        Ok(results)
    }

    pub fn read_set(&self, handles: &[MessageHandle]) -> MqResult<Vec<Message>> {
        self.for_each(handles, |h| self.adopt(h))
    }

    pub fn read_and_delete_set(&self, handles: &[MessageHandle], tran: Option<&Transaction>) -> MqResult<Vec<Message>> {
        if let Some(tran) = tran {
            tran.check_active()?;
        }
        self.for_each(handles, |h| {
            let message = self.adopt(h)?;
            self.delete(h, tran)?;
            Ok(message)
        })
    }

    pub fn delete_set(&self, handles: &[MessageHandle], tran: Option<&Transaction>) -> MqResult<()> {
        if let Some(tran) = tran {
            tran.check_active()?;
        }
        self.for_each(handles, |h| {
            self.adopt(h)?;
            self.delete(h, tran)
        }).map(|_| ())
    }

    pub fn unlock_set(&self, handles: &[MessageHandle]) -> MqResult<()> {
        self.for_each(handles, |h| {
            self.adopt(h)?;
            self.primary.destination().unlock(h, self.id, true).map(|_| ())
        }).map(|_| ())
    }

    fn delete(&self, handle: MessageHandle, tran: Option<&Transaction>) -> MqResult<()> {
        let destination = self.primary.destination();
        match tran {
            Some(tran) => tran.delete_locked(destination, handle, self.id, None),
            None => destination.delete(handle, self.id).map(|_| ()),
        }
    }

    /// Unlocks (with increment) every message this session adopted and did not resolve
    pub fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let num_unlocked = self.primary.destination().unlock_all(self.id, true);
        debug!("closed {:?}, unlocked {} messages", self.id, num_unlocked);
        Ok(())
    }
}
