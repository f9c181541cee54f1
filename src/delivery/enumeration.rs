use tracing::{debug, trace, warn};

use crate::delivery::consumer::ConsumerCore;
use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::error::{ErrorKind, MqError, MqResult};
use crate::transaction::Transaction;

/// The batch of messages handed to an asynchronous consumer callback, with a cursor over it.
///
/// The enumeration borrows its session for the duration of the callback. When the callback
///  returns, messages the cursor never reached are unlocked without incrementing their
///  redelivery count, while messages that were seen but neither deleted nor unlocked stay
///  locked to the session.
pub struct LockedMessageEnumeration<'a> {
    session: &'a ConsumerCore,
    messages: Vec<Message>,
    seen: Vec<bool>,
    /// deleted, unlocked, or no longer locked to the session
    resolved: Vec<bool>,
    /// index of the next candidate for `next_locked`
    position: usize,
    current: Option<usize>,
}

impl<'a> LockedMessageEnumeration<'a> {
    pub(crate) fn new(session: &'a ConsumerCore, messages: Vec<Message>) -> LockedMessageEnumeration<'a> {
        let n = messages.len();
        LockedMessageEnumeration {
            session,
            messages,
            seen: vec![false; n],
            resolved: vec![false; n],
            position: 0,
            current: None,
        }
    }

    pub fn consumer_session_id(&self) -> SessionId {
        self.session.id()
    }

    /// all handles in this batch, in delivery order
    pub fn message_handles(&self) -> Vec<MessageHandle> {
        self.messages.iter().map(|m| m.handle).collect()
    }

    fn is_still_locked(&self, idx: usize) -> bool {
        self.session.destination().is_locked_to(self.messages[idx].handle, self.session.id())
    }

    fn next_candidate(&self, from: usize) -> Option<usize> {
        (from..self.messages.len())
            .find(|i| !self.resolved[*i] && self.is_still_locked(*i))
    }

    /// Advances the cursor to the next message still locked to the session
    pub fn next_locked(&mut self) -> MqResult<Option<Message>> {
        let candidate = self.next_candidate(self.position);
        // messages that lost their lock in between were skipped
        let end = candidate.unwrap_or(self.messages.len());
        for i in self.position..end {
            if !self.resolved[i] {
                trace!("{:?} is no longer locked to the session", self.messages[i].handle);
                self.resolved[i] = true;
            }
        }

        match candidate {
            Some(idx) => {
                self.seen[idx] = true;
                self.position = idx + 1;
                self.current = Some(idx);
                Ok(Some(self.messages[idx].clone()))
            }
            None => {
                self.position = self.messages.len();
                self.current = None;
                Ok(None)
            }
        }
    }

    /// The message `next_locked` would return, without moving the cursor
    pub fn peek(&self) -> Option<Message> {
        self.next_candidate(self.position)
            .map(|idx| self.messages[idx].clone())
    }

    /// number of messages after the cursor that are still locked to the session
    pub fn remaining_message_count(&self) -> usize {
        (self.position..self.messages.len())
            .filter(|i| !self.resolved[*i] && self.is_still_locked(*i))
            .count()
    }

    fn current_handle(&self) -> MqResult<(usize, MessageHandle)> {
        self.current
            .map(|idx| (idx, self.messages[idx].handle))
            .ok_or_else(|| MqError::new(ErrorKind::MessageNotLocked, "there is no current message"))
    }

    pub fn delete_current(&mut self, tran: Option<&Transaction>) -> MqResult<()> {
        let (idx, handle) = self.current_handle()?;
        if let Some(tran) = tran {
            tran.check_active()?;
        }

        let result = self.session.delete_one(handle, tran);
        if !matches!(&result, Err(e) if e.kind == ErrorKind::IncorrectCall) {
            self.resolved[idx] = true;
            self.current = None;
        }
        result
    }

    /// Unlocks the current message, incrementing its redelivery count
    pub fn unlock_current(&mut self) -> MqResult<()> {
        let (idx, handle) = self.current_handle()?;
        let result = self.session.destination().unlock(handle, self.session.id(), true);
        self.resolved[idx] = true;
        self.current = None;
        result.map(|_| ())
    }

    /// Deletes all messages seen so far that were not deleted or unlocked yet: those retained
    ///  from earlier batches, and those of this batch up to and including the cursor
    pub fn delete_seen(&mut self, tran: Option<&Transaction>) -> MqResult<()> {
        if let Some(tran) = tran {
            tran.check_active()?;
        }

        let retained = self.session.take_retained();
        let batch_indexes = (0..self.position)
            .filter(|i| self.seen[*i] && !self.resolved[*i])
            .collect::<Vec<_>>();

        let mut succeeded = Vec::new();
        for (n, handle) in retained.iter().enumerate() {
            if let Err(e) = self.session.delete_one(*handle, tran) {
                self.session.restore_retained(&retained[n+1..]);
                return Err(e.with_succeeded(succeeded));
            }
            succeeded.push(*handle);
        }
        for idx in batch_indexes {
            let handle = self.messages[idx].handle;
            let result = self.session.delete_one(handle, tran);
            self.resolved[idx] = true;
            if self.current == Some(idx) {
                self.current = None;
            }
            if let Err(e) = result {
                return Err(e.with_succeeded(succeeded));
            }
            succeeded.push(handle);
        }
        Ok(())
    }

    /// Moves the cursor back before the first message that is still locked to the session
    pub fn reset_cursor(&mut self) {
        self.position = 0;
        self.current = None;
    }

    /// after a failing callback: the message at the cursor counts as a failed delivery
    pub(crate) fn unlock_current_after_failure(&mut self) {
        let Some(idx) = self.current.take() else {
            return;
        };
        let handle = self.messages[idx].handle;
        match self.session.destination().unlock(handle, self.session.id(), true) {
            Ok(_) => self.resolved[idx] = true,
            Err(e) if !self.is_still_locked(idx) => {
                debug!("{:?} lost its lock before the failed callback was reconciled: {}", handle, e);
                self.resolved[idx] = true;
            }
            // stays retained by the session
            Err(e) => warn!("cannot unlock {:?} after a failed callback: {}", handle, e),
        }
    }

    /// Splits the batch into messages that were never visited and messages that were seen
    ///  but not resolved
    pub(crate) fn finish(self) -> (Vec<MessageHandle>, Vec<MessageHandle>) {
        let mut unseen = Vec::new();
        let mut retained = Vec::new();
        for (idx, message) in self.messages.iter().enumerate() {
            if self.resolved[idx] {
                continue;
            }
            if self.seen[idx] {
                retained.push(message.handle);
            }
            else {
                unseen.push(message.handle);
            }
        }
        (unseen, retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::Arc;

    use tokio::runtime::Handle;

    use crate::config::DestinationConfig;
    use std::time::Duration;
    use tokio::time::Instant;
    use crate::delivery::consumer::{AsyncConsumerOptions, ConsumerSession, UnlockAllOutcome};
    use crate::dispatch::dispatcher::Dispatcher;
    use crate::test_util::delivery::{consumer_session, test_destination, RecordingCallback};
    use crate::transaction::UncoordinatedTransaction;

    /// runs one batch of `batch_size` messages through `f` on the calling thread
    fn run_one_batch(session: &ConsumerSession, batch_size: usize, f: impl Fn(&mut LockedMessageEnumeration) -> anyhow::Result<()> + Send + Sync + 'static) -> Arc<RecordingCallback> {
        let callback = RecordingCallback::new(f);
        session.register_async_consumer_callback(callback.clone(), AsyncConsumerOptions::new(batch_size)).unwrap();
        session.start(true).unwrap();
        session.stop().unwrap();
        callback
    }

    fn session_with(n: usize) -> (Arc<crate::delivery::destination::Destination>, ConsumerSession) {
        let destination = test_destination(n, DestinationConfig::default());
        let session = consumer_session(&destination, Dispatcher::new(Handle::current(), 2));
        (destination, session)
    }

    #[tokio::test]
    async fn test_failure_after_lock_expired() {
        let (destination, session) = session_with(2);
        let d = destination.clone();
        let callback = RecordingCallback::new(move |e| {
            e.next_locked()?;
            d.expire(Instant::now() + Duration::from_secs(60));
            anyhow::bail!("failed after the lock expired")
        });
        let mut options = AsyncConsumerOptions::new(1);
        options.message_lock_expiry = Some(Duration::from_secs(30));
        session.register_async_consumer_callback(callback.clone(), options).unwrap();
        session.start(true).unwrap();
        session.stop().unwrap();

        let handle = callback.batches()[0][0];
        // incremented by the expiry only, not a second time for the failure
        assert_eq!(destination.message(handle).unwrap().redelivery_count, 1);
        assert!(destination.locked_to(session.id()).is_empty());
        // not retained either
        assert_eq!(session.unlock_all_with(false).unwrap(), UnlockAllOutcome::default());
    }

    #[tokio::test]
    async fn test_reset_cursor_is_idempotent() {
        let (_destination, session) = session_with(4);
        let passes = Arc::new(Mutex::new(Vec::new()));
        let p = passes.clone();
        run_one_batch(&session, 4, move |e| {
            for _ in 0..2 {
                let mut pass = Vec::new();
                for _ in 0..3 {
                    pass.push(e.next_locked()?.unwrap().handle);
                }
                p.lock().unwrap().push(pass);
                e.reset_cursor();
            }
            Ok(())
        });

        let passes = passes.lock().unwrap();
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0], passes[1]);
        assert_eq!(passes[0], vec![MessageHandle(1), MessageHandle(2), MessageHandle(3)]);
    }

    #[tokio::test]
    async fn test_no_current_message() {
        let (_destination, session) = session_with(1);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errs = errors.clone();
        run_one_batch(&session, 1, move |e| {
            // before the first next_locked
            errs.lock().unwrap().push(e.delete_current(None).unwrap_err().kind);
            e.next_locked()?;
            e.delete_current(None)?;
            // already deleted
            errs.lock().unwrap().push(e.unlock_current().unwrap_err().kind);
            e.next_locked()?;
            // after the end
            errs.lock().unwrap().push(e.delete_current(None).unwrap_err().kind);
            Ok(())
        });
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::MessageNotLocked; 3]);
    }

    #[tokio::test]
    async fn test_reconcile_unseen_and_retained() {
        let (destination, session) = session_with(4);
        run_one_batch(&session, 4, |e| {
            e.next_locked()?;
            e.delete_current(None)?;
            e.next_locked()?;
            e.unlock_current()?;
            e.next_locked()?;
            Ok(())
        });

        // message 1 deleted, 2 unlocked with increment, 3 retained, 4 unlocked without
        assert!(destination.message(MessageHandle(1)).is_none());
        assert_eq!(destination.message(MessageHandle(2)).unwrap().redelivery_count, 1);
        assert!(destination.is_locked_to(MessageHandle(3), session.id()));
        assert_eq!(destination.message(MessageHandle(4)).unwrap().redelivery_count, 0);
        assert!(!destination.is_locked_to(MessageHandle(4), session.id()));
    }

    #[tokio::test]
    async fn test_delete_seen_includes_retained() {
        let (destination, session) = session_with(3);
        let callback = RecordingCallback::new(|e| {
            if e.message_handles()[0] == MessageHandle(1) {
                // first batch: see both, resolve nothing
                e.next_locked()?;
                e.next_locked()?;
            }
            else {
                e.next_locked()?;
                e.delete_seen(None)?;
            }
            Ok(())
        });
        session.register_async_consumer_callback(callback.clone(), AsyncConsumerOptions::new(2)).unwrap();
        session.start(true).unwrap();
        assert_eq!(destination.locked_to(session.id()).len(), 2);

        callback.wait_for_messages(3).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while destination.depth() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        }).await.unwrap();
        assert!(destination.locked_to(session.id()).is_empty());
    }

    #[tokio::test]
    async fn test_peek_and_remaining() {
        let (_destination, session) = session_with(3);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let o = observed.clone();
        run_one_batch(&session, 3, move |e| {
            let mut o = o.lock().unwrap();
            o.push((e.peek().map(|m| m.handle), e.remaining_message_count()));
            e.next_locked()?;
            o.push((e.peek().map(|m| m.handle), e.remaining_message_count()));
            e.next_locked()?;
            e.next_locked()?;
            o.push((e.peek().map(|m| m.handle), e.remaining_message_count()));
            Ok(())
        });
        assert_eq!(*observed.lock().unwrap(), vec![
            (Some(MessageHandle(1)), 3),
            (Some(MessageHandle(2)), 2),
            (None, 0),
        ]);
    }

    #[tokio::test]
    async fn test_skips_messages_that_lost_their_lock() {
        let (destination, session) = session_with(3);
        let d = destination.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        run_one_batch(&session, 3, move |e| {
            // another party takes message 2 away, e.g. through lock expiry
            d.unlock(MessageHandle(2), e.consumer_session_id(), true)?;
            while let Some(m) = e.next_locked()? {
                s.lock().unwrap().push(m.handle);
            }
            Ok(())
        });
        assert_eq!(*seen.lock().unwrap(), vec![MessageHandle(1), MessageHandle(3)]);
    }

    #[tokio::test]
    async fn test_delete_under_inactive_transaction() {
        let (destination, session) = session_with(1);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        run_one_batch(&session, 1, move |e| {
            let tran = UncoordinatedTransaction::new(1);
            tran.commit()?;
            e.next_locked()?;
            *r.lock().unwrap() = Some(e.delete_current(Some(tran.transaction())));
            // the message is still current and can be deleted without the transaction
            e.delete_current(None)?;
            Ok(())
        });
        assert_eq!(result.lock().unwrap().take().unwrap().unwrap_err().kind, ErrorKind::IncorrectCall);
        assert_eq!(destination.depth(), 0);
    }
}
