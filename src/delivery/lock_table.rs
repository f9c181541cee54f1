use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::error::{MqError, MqResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Available,
    Locked { owner: SessionId, expiry: Option<Instant> },
    /// deleted under a transaction that is not complete yet
    PendingDelete { owner: SessionId, transaction: u64 },
    /// unavailable after a rollback until `until`
    Hidden { hidden_by: SessionId, until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub redelivery_count: u32,
    pub moved_to_exception_list: bool,
}

struct Entry {
    message: Message,
    state: MessageState,
}

/// The messages of one destination together with their lock state. This is pure bookkeeping
///  without synchronization, the destination wraps it in a mutex.
pub struct LockTable {
    entries: BTreeMap<MessageHandle, Entry>,
    next_handle: u64,
    max_failed_deliveries: u32,
    exception_list: Vec<Message>,
}

impl LockTable {
    pub fn new(max_failed_deliveries: u32) -> LockTable {
        LockTable {
            entries: Default::default(),
            next_handle: 1,
            max_failed_deliveries,
            exception_list: Vec::new(),
        }
    }

    pub fn put(&mut self, payload: Bytes) -> MessageHandle {
        let handle = MessageHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(handle, Entry {
            message: Message { handle, payload, redelivery_count: 0 },
            state: MessageState::Available,
        });
        handle
    }

    /// all messages, whatever their state
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_available(&self) -> usize {
        self.entries.values()
            .filter(|e| e.state == MessageState::Available)
            .count()
    }

    pub fn state(&self, handle: MessageHandle) -> Option<MessageState> {
        self.entries.get(&handle).map(|e| e.state)
    }

    pub fn message(&self, handle: MessageHandle) -> Option<&Message> {
        self.entries.get(&handle).map(|e| &e.message)
    }

    pub fn is_locked_to(&self, handle: MessageHandle, owner: SessionId) -> bool {
        matches!(self.state(handle), Some(MessageState::Locked { owner: o, .. }) if o == owner)
    }

    /// Locks up to `max` available messages to `owner`, oldest first
    pub fn lock_batch(&mut self, owner: SessionId, max: usize, expiry: Option<Instant>) -> Vec<Message> {
        let mut result = Vec::new();
        for entry in self.entries.values_mut() {
            if result.len() >= max {
                break;
            }
            if entry.state == MessageState::Available {
                entry.state = MessageState::Locked { owner, expiry };
                result.push(entry.message.clone());
            }
        }
        trace!("locked {} messages to {:?}", result.len(), owner);
        result
    }

    pub fn lock_next(&mut self, owner: SessionId, expiry: Option<Instant>) -> Option<Message> {
        self.lock_batch(owner, 1, expiry).pop()
    }

    /// Removes the oldest available message without ever locking it
    pub fn take_next(&mut self) -> Option<Message> {
        let handle = self.entries.iter()
            .find(|(_, e)| e.state == MessageState::Available)
            .map(|(h, _)| *h)?;
        self.entries.remove(&handle).map(|e| e.message)
    }

    fn locked_entry(&mut self, handle: MessageHandle, owner: SessionId) -> MqResult<&mut Entry> {
        match self.entries.get_mut(&handle) {
            Some(entry) if matches!(entry.state, MessageState::Locked { owner: o, .. } if o == owner) => Ok(entry),
            _ => Err(MqError::not_locked(handle)),
        }
    }

    pub fn unlock(&mut self, handle: MessageHandle, owner: SessionId, increment: bool) -> MqResult<UnlockOutcome> {
        self.locked_entry(handle, owner)?;
        Ok(self.make_available(handle, increment, None))
    }

    /// The common path for everything that returns a message to the pool. A message that
    ///  reached the max number of failed deliveries goes to the exception list instead.
    fn make_available(&mut self, handle: MessageHandle, increment: bool, hide: Option<(SessionId, Instant)>) -> UnlockOutcome {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return UnlockOutcome { redelivery_count: 0, moved_to_exception_list: false };
        };

        if increment {
            entry.message.redelivery_count += 1;
        }
        let redelivery_count = entry.message.redelivery_count;

        if increment && redelivery_count >= self.max_failed_deliveries {
            debug!("{:?} failed {} times - moving it to the exception list", handle, redelivery_count);
            if let Some(entry) = self.entries.remove(&handle) {
                self.exception_list.push(entry.message);
            }
            return UnlockOutcome { redelivery_count, moved_to_exception_list: true };
        }

        entry.state = match hide {
            Some((hidden_by, until)) => MessageState::Hidden { hidden_by, until },
            None => MessageState::Available,
        };
        UnlockOutcome { redelivery_count, moved_to_exception_list: false }
    }

    pub fn delete(&mut self, handle: MessageHandle, owner: SessionId) -> MqResult<Message> {
        self.locked_entry(handle, owner)?;
        self.entries.remove(&handle)
            .map(|e| e.message)
            .ok_or_else(|| MqError::not_locked(handle))
    }

    pub fn delete_under_transaction(&mut self, handle: MessageHandle, owner: SessionId, transaction: u64) -> MqResult<()> {
        let entry = self.locked_entry(handle, owner)?;
        entry.state = MessageState::PendingDelete { owner, transaction };
        Ok(())
    }

    pub fn is_pending_delete(&self, handle: MessageHandle, transaction: u64) -> bool {
        matches!(self.state(handle), Some(MessageState::PendingDelete { transaction: t, .. }) if t == transaction)
    }

    pub fn commit_delete(&mut self, handle: MessageHandle, transaction: u64) -> MqResult<Message> {
        if !self.is_pending_delete(handle, transaction) {
            return Err(MqError::not_locked(handle));
        }
        self.entries.remove(&handle)
            .map(|e| e.message)
            .ok_or_else(|| MqError::not_locked(handle))
    }

    pub fn rollback_delete(&mut self, handle: MessageHandle, transaction: u64, hide: Option<(SessionId, Instant)>) -> MqResult<UnlockOutcome> {
        if !self.is_pending_delete(handle, transaction) {
            return Err(MqError::not_locked(handle));
        }
        Ok(self.make_available(handle, true, hide))
    }

    /// Moves a lock from one session to another
    pub fn transfer(&mut self, handle: MessageHandle, from: SessionId, to: SessionId) -> MqResult<Message> {
        let entry = self.locked_entry(handle, from)?;
        let MessageState::Locked { expiry, .. } = entry.state else {
            return Err(MqError::not_locked(handle));
        };
        entry.state = MessageState::Locked { owner: to, expiry };
        Ok(entry.message.clone())
    }

    /// Unlocks (with increment) every message whose lock expired
    pub fn expire_locks(&mut self, now: Instant) -> Vec<MessageHandle> {
        let expired = self.entries.iter()
            .filter(|(_, e)| matches!(e.state, MessageState::Locked { expiry: Some(expiry), .. } if expiry <= now))
            .map(|(h, _)| *h)
            .collect::<Vec<_>>();
        for handle in &expired {
            debug!("lock on {:?} expired", handle);
            self.make_available(*handle, true, None);
        }
        expired
    }

    pub fn release_hidden(&mut self, now: Instant) -> usize {
        self.release_hidden_where(|_, until| until <= now)
    }

    pub fn release_hidden_by(&mut self, session: SessionId) -> usize {
        self.release_hidden_where(|hidden_by, _| hidden_by == session)
    }

    fn release_hidden_where(&mut self, predicate: impl Fn(SessionId, Instant) -> bool) -> usize {
        let mut num_released = 0;
        for entry in self.entries.values_mut() {
            if let MessageState::Hidden { hidden_by, until } = entry.state {
                if predicate(hidden_by, until) {
                    entry.state = MessageState::Available;
                    num_released += 1;
                }
            }
        }
        num_released
    }

    pub fn num_hidden_by(&self, session: SessionId) -> usize {
        self.entries.values()
            .filter(|e| matches!(e.state, MessageState::Hidden { hidden_by, .. } if hidden_by == session))
            .count()
    }

    pub fn locked_to(&self, owner: SessionId) -> Vec<MessageHandle> {
        self.entries.iter()
            .filter(|(_, e)| matches!(e.state, MessageState::Locked { owner: o, .. } if o == owner))
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn unlock_all(&mut self, owner: SessionId, increment: bool) -> usize {
        let handles = self.locked_to(owner);
        for handle in &handles {
            self.make_available(*handle, increment, None);
        }
        handles.len()
    }

    /// The next message after `after` that is not being deleted, regardless of locks
    pub fn browse_after(&self, after: Option<MessageHandle>) -> Option<Message> {
        let lower = after.map(|h| MessageHandle(h.0 + 1)).unwrap_or(MessageHandle(0));
        self.entries.range(lower..)
            .find(|(_, e)| !matches!(e.state, MessageState::PendingDelete { .. }))
            .map(|(_, e)| e.message.clone())
    }

    pub fn exception_list(&self) -> &[Message] {
        &self.exception_list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use crate::error::ErrorKind;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    fn table_with(n: usize) -> (LockTable, Vec<MessageHandle>) {
        let mut table = LockTable::new(5);
        let handles = (0..n)
            .map(|i| table.put(Bytes::from(format!("m{}", i))))
            .collect();
        (table, handles)
    }

    #[test]
    fn test_lock_in_arrival_order() {
        let (mut table, handles) = table_with(3);
        let locked = table.lock_batch(A, 2, None);
        assert_eq!(locked.iter().map(|m| m.handle).collect::<Vec<_>>(), handles[..2].to_vec());
        assert_eq!(table.lock_next(B, None).unwrap().handle, handles[2]);
        assert!(table.lock_next(B, None).is_none());
        assert_eq!(table.locked_to(A), handles[..2].to_vec());
    }

    #[test]
    fn test_only_owner_can_act() {
        let (mut table, handles) = table_with(1);
        let h = handles[0];
        table.lock_next(A, None).unwrap();

        assert_eq!(table.unlock(h, B, true).unwrap_err().kind, ErrorKind::MessageNotLocked);
        assert_eq!(table.delete(h, B).unwrap_err().kind, ErrorKind::MessageNotLocked);
        assert_eq!(table.transfer(h, B, A).unwrap_err().kind, ErrorKind::MessageNotLocked);
        assert!(table.is_locked_to(h, A));
    }

    #[test]
    fn test_unlock_increments_delete_does_not() {
        let (mut table, handles) = table_with(2);
        table.lock_batch(A, 2, None);

        let outcome = table.unlock(handles[0], A, true).unwrap();
        assert_eq!(outcome, UnlockOutcome { redelivery_count: 1, moved_to_exception_list: false });
        table.unlock(handles[1], A, false).unwrap();
        assert_eq!(table.message(handles[1]).unwrap().redelivery_count, 0);

        let locked = table.lock_next(B, None).unwrap();
        assert_eq!(locked.redelivery_count, 1);
        let deleted = table.delete(handles[0], B).unwrap();
        assert_eq!(deleted.redelivery_count, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_exhausted_message_goes_to_exception_list() {
        let mut table = LockTable::new(2);
        let h = table.put(Bytes::from_static(b"poison"));

        table.lock_next(A, None).unwrap();
        assert!(!table.unlock(h, A, true).unwrap().moved_to_exception_list);
        table.lock_next(A, None).unwrap();
        assert!(table.unlock(h, A, true).unwrap().moved_to_exception_list);

        assert!(table.is_empty());
        assert_eq!(table.exception_list().len(), 1);
        assert_eq!(table.exception_list()[0].redelivery_count, 2);
    }

    #[test]
    fn test_transactional_delete() {
        let (mut table, handles) = table_with(2);
        table.lock_batch(A, 2, None);

        table.delete_under_transaction(handles[0], A, 7).unwrap();
        table.delete_under_transaction(handles[1], A, 7).unwrap();
        assert!(table.is_pending_delete(handles[0], 7));
        assert!(!table.is_pending_delete(handles[0], 8));
        // pending deletes are neither locked nor available
        assert!(!table.is_locked_to(handles[0], A));
        assert!(table.lock_next(B, None).is_none());

        table.commit_delete(handles[0], 7).unwrap();
        let outcome = table.rollback_delete(handles[1], 7, None).unwrap();
        assert_eq!(outcome.redelivery_count, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.state(handles[1]), Some(MessageState::Available));
    }

    #[test]
    fn test_rollback_with_hiding() {
        let (mut table, handles) = table_with(1);
        let now = Instant::now();
        table.lock_next(A, None).unwrap();
        table.delete_under_transaction(handles[0], A, 1).unwrap();
        table.rollback_delete(handles[0], 1, Some((A, now + Duration::from_secs(5)))).unwrap();

        assert_eq!(table.num_hidden_by(A), 1);
        assert!(table.lock_next(B, None).is_none());
        assert_eq!(table.release_hidden(now + Duration::from_secs(4)), 0);
        assert_eq!(table.release_hidden(now + Duration::from_secs(5)), 1);
        assert_eq!(table.lock_next(B, None).unwrap().redelivery_count, 1);
    }

    #[test]
    fn test_release_hidden_by_session() {
        let (mut table, handles) = table_with(2);
        let until = Instant::now() + Duration::from_secs(60);
        table.lock_batch(A, 2, None);
        for h in &handles {
            table.delete_under_transaction(*h, A, 1).unwrap();
        }
        table.rollback_delete(handles[0], 1, Some((A, until))).unwrap();
        table.rollback_delete(handles[1], 1, Some((B, until))).unwrap();

        assert_eq!(table.release_hidden_by(A), 1);
        assert_eq!(table.num_available(), 1);
        assert_eq!(table.num_hidden_by(B), 1);
    }

    #[test]
    fn test_expire_locks() {
        let (mut table, handles) = table_with(2);
        let now = Instant::now();
        table.lock_next(A, Some(now + Duration::from_secs(1))).unwrap();
        table.lock_next(A, None).unwrap();

        assert!(table.expire_locks(now).is_empty());
        assert_eq!(table.expire_locks(now + Duration::from_secs(1)), vec![handles[0]]);
        assert_eq!(table.message(handles[0]).unwrap().redelivery_count, 1);
        assert_eq!(table.locked_to(A), vec![handles[1]]);
    }

    #[test]
    fn test_transfer() {
        let (mut table, handles) = table_with(1);
        table.lock_next(A, None).unwrap();
        table.transfer(handles[0], A, B).unwrap();
        assert!(table.is_locked_to(handles[0], B));
        assert_eq!(table.unlock(handles[0], A, true).unwrap_err().kind, ErrorKind::MessageNotLocked);
    }

    #[test]
    fn test_unlock_all() {
        let (mut table, handles) = table_with(3);
        table.lock_batch(A, 3, None);
        assert_eq!(table.unlock_all(A, true), 3);
        assert!(table.locked_to(A).is_empty());
        for h in handles {
            assert_eq!(table.message(h).unwrap().redelivery_count, 1);
        }
    }

    #[test]
    fn test_browse_and_take() {
        let (mut table, handles) = table_with(3);
        table.lock_next(A, None).unwrap();
        table.delete_under_transaction(handles[0], A, 1).unwrap();

        assert_eq!(table.browse_after(None).unwrap().handle, handles[1]);
        assert_eq!(table.browse_after(Some(handles[1])).unwrap().handle, handles[2]);
        assert!(table.browse_after(Some(handles[2])).is_none());

        assert_eq!(table.take_next().unwrap().handle, handles[1]);
        assert_eq!(table.len(), 2);
    }

    /// a seeded random sequence of operations by several sessions: no message is ever
    ///  locked to two sessions, and only unlocks change redelivery counts
    #[test]
    fn test_mutual_exclusion() {
        let sessions = [SessionId(1), SessionId(2), SessionId(3)];
        let mut table = LockTable::new(u32::MAX);
        for i in 0..10 {
            table.put(Bytes::from(vec![i]));
        }

        let mut rng = StdRng::seed_from_u64(0x2545_f491);

        let mut expected_counts = std::collections::HashMap::new();
        for _ in 0..2000 {
            let session = sessions[rng.gen_range(0..sessions.len())];
            let handle = MessageHandle(rng.gen_range(1..=10));
            let before = table.message(handle).map(|m| m.redelivery_count);
            let owner_before = match table.state(handle) {
                Some(MessageState::Locked { owner, .. }) => Some(owner),
                _ => None,
            };

            match rng.gen_range(0..4) {
                0 => { table.lock_next(session, None); }
                1 => {
                    let result = table.unlock(handle, session, true);
                    assert_eq!(result.is_ok(), owner_before == Some(session));
                    if result.is_ok() {
                        expected_counts.insert(handle, before.unwrap_or(0) + 1);
                    }
                }
                2 => {
                    let result = table.unlock(handle, session, false);
                    assert_eq!(result.is_ok(), owner_before == Some(session));
                }
                _ => {
                    let result = table.transfer(handle, session, sessions[rng.gen_range(0..sessions.len())]);
                    assert_eq!(result.is_ok(), owner_before == Some(session));
                }
            }

            for (h, count) in &expected_counts {
                assert_eq!(table.message(*h).map(|m| m.redelivery_count), Some(*count));
            }
            let locked = sessions.iter()
                .map(|s| table.locked_to(*s).len())
                .sum::<usize>();
            let num_locked = (1..=10)
                .filter(|h| matches!(table.state(MessageHandle(*h)), Some(MessageState::Locked { .. })))
                .count();
            assert_eq!(locked, num_locked);
        }
    }
}
