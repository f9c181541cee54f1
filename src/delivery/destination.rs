use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DestinationConfig;
use crate::delivery::lock_table::{LockTable, UnlockOutcome};
use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::error::{ErrorKind, MqError, MqResult};

/// Asynchronous consumers register for a nudge whenever messages (may have) become available.
///  Implementations must not block.
pub trait AvailabilityListener: Send + Sync + 'static {
    fn messages_available(&self);
}

/// A queue of messages with per-message locks. All lock table mutations go through one mutex;
///  listeners are notified after it is released.
pub struct Destination {
    name: String,
    config: DestinationConfig,
    table: Mutex<LockTable>,
    available: Notify,
    listeners: Mutex<FxHashMap<SessionId, Weak<dyn AvailabilityListener>>>,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Destination {
    pub fn new(name: impl Into<String>, config: DestinationConfig) -> Arc<Destination> {
        Arc::new(Destination {
            name: name.into(),
            table: Mutex::new(LockTable::new(match config.exception_list {
                true => config.max_failed_deliveries,
                false => u32::MAX,
            })),
            config,
            available: Notify::new(),
            listeners: Default::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn put(&self, payload: Bytes) -> MqResult<MessageHandle> {
        let handle = {
            let mut table = self.table.lock().unwrap();
            if self.config.max_depth > 0 && table.len() >= self.config.max_depth {
                return Err(MqError::new(ErrorKind::LimitExceeded, format!("destination {} is full ({} messages)", self.name, table.len())));
            }
            table.put(payload)
        };
        trace!(destination = self.name, "put {:?}", handle);
        self.notify_available();
        Ok(handle)
    }

    pub fn has_room_for(&self, num_messages: usize) -> bool {
        self.config.max_depth == 0 || self.depth() + num_messages <= self.config.max_depth
    }

    /// number of messages in the destination, locked or not
    pub fn depth(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn num_available(&self) -> usize {
        self.table.lock().unwrap().num_available()
    }

    pub fn message(&self, handle: MessageHandle) -> Option<Message> {
        self.table.lock().unwrap().message(handle).cloned()
    }

    pub fn exception_list(&self) -> Vec<Message> {
        self.table.lock().unwrap().exception_list().to_vec()
    }

    pub fn is_locked_to(&self, handle: MessageHandle, owner: SessionId) -> bool {
        self.table.lock().unwrap().is_locked_to(handle, owner)
    }

    pub fn locked_to(&self, owner: SessionId) -> Vec<MessageHandle> {
        self.table.lock().unwrap().locked_to(owner)
    }

    pub(crate) fn lock_batch(&self, owner: SessionId, max: usize, expiry: Option<Instant>) -> Vec<Message> {
        self.table.lock().unwrap().lock_batch(owner, max, expiry)
    }

    pub(crate) fn lock_next(&self, owner: SessionId) -> Option<Message> {
        self.table.lock().unwrap().lock_next(owner, None)
    }

    pub(crate) fn take_next(&self) -> Option<Message> {
        self.table.lock().unwrap().take_next()
    }

    pub(crate) fn unlock(&self, handle: MessageHandle, owner: SessionId, increment: bool) -> MqResult<UnlockOutcome> {
        let outcome = self.table.lock().unwrap().unlock(handle, owner, increment)?;
        if !outcome.moved_to_exception_list {
            self.notify_available();
        }
        Ok(outcome)
    }

    /// Unlocks without reporting individual failures, for cleanup of messages that may have
    ///  been resolved concurrently
    pub(crate) fn unlock_if_locked(&self, handles: &[MessageHandle], owner: SessionId, increment: bool) -> usize {
        let num_unlocked = {
            let mut table = self.table.lock().unwrap();
            handles.iter()
                .filter(|h| table.unlock(**h, owner, increment).is_ok())
                .count()
        };
        if num_unlocked > 0 {
            self.notify_available();
        }
        num_unlocked
    }

    pub(crate) fn unlock_all(&self, owner: SessionId, increment: bool) -> usize {
        let num_unlocked = self.table.lock().unwrap().unlock_all(owner, increment);
        if num_unlocked > 0 {
            self.notify_available();
        }
        num_unlocked
    }

    pub(crate) fn delete(&self, handle: MessageHandle, owner: SessionId) -> MqResult<Message> {
        self.table.lock().unwrap().delete(handle, owner)
    }

    pub(crate) fn delete_under_transaction(&self, handle: MessageHandle, owner: SessionId, transaction: u64) -> MqResult<()> {
        self.table.lock().unwrap().delete_under_transaction(handle, owner, transaction)
    }

    pub(crate) fn is_pending_delete(&self, handle: MessageHandle, transaction: u64) -> bool {
        self.table.lock().unwrap().is_pending_delete(handle, transaction)
    }

    pub(crate) fn commit_delete(&self, handle: MessageHandle, transaction: u64) -> MqResult<Message> {
        self.table.lock().unwrap().commit_delete(handle, transaction)
    }

    /// Makes a message deleted under a rolled back transaction available again, or hides it for
    ///  `hide_for` on behalf of `session`
    pub(crate) fn rollback_delete(&self, handle: MessageHandle, transaction: u64, session: SessionId, hide_for: Option<Duration>) -> MqResult<UnlockOutcome> {
        let hide = hide_for.map(|d| (session, Instant::now() + d));
        let outcome = self.table.lock().unwrap().rollback_delete(handle, transaction, hide)?;
        if hide.is_none() && !outcome.moved_to_exception_list {
            self.notify_available();
        }
        Ok(outcome)
    }

    pub(crate) fn transfer(&self, handle: MessageHandle, from: SessionId, to: SessionId) -> MqResult<Message> {
        self.table.lock().unwrap().transfer(handle, from, to)
    }

    pub(crate) fn num_hidden_by(&self, session: SessionId) -> usize {
        self.table.lock().unwrap().num_hidden_by(session)
    }

    pub(crate) fn release_hidden_by(&self, session: SessionId) -> usize {
        let num_released = self.table.lock().unwrap().release_hidden_by(session);
        if num_released > 0 {
            self.notify_available();
        }
        num_released
    }

    /// Expires locks and re-exposes hidden messages whose time has come. Returns the number of
    ///  messages affected.
    pub fn expire(&self, now: Instant) -> usize {
        let num_affected = {
            let mut table = self.table.lock().unwrap();
            table.expire_locks(now).len() + table.release_hidden(now)
        };
        if num_affected > 0 {
            debug!(destination = self.name, "{} messages became available through expiry", num_affected);
            self.notify_available();
        }
        num_affected
    }

    pub(crate) fn browse_after(&self, after: Option<MessageHandle>) -> Option<Message> {
        self.table.lock().unwrap().browse_after(after)
    }

    pub(crate) fn subscribe(&self, session: SessionId, listener: Weak<dyn AvailabilityListener>) {
        self.listeners.lock().unwrap().insert(session, listener);
    }

    pub(crate) fn unsubscribe(&self, session: SessionId) {
        self.listeners.lock().unwrap().remove(&session);
    }

    /// For synchronous receivers: the returned future completes on the next availability change
    ///  after it was enabled
    pub(crate) fn available_notified(&self) -> Notified<'_> {
        self.available.notified()
    }

    fn notify_available(&self) {
        self.available.notify_waiters();

        let listeners = self.listeners.lock().unwrap()
            .values()
            .filter_map(|l| l.upgrade())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener.messages_available();
        }
    }
}

/// The destinations of a messaging context, by name
pub struct DestinationRegistry {
    default_config: DestinationConfig,
    destinations: Mutex<FxHashMap<String, Arc<Destination>>>,
}

impl DestinationRegistry {
    pub fn new(default_config: DestinationConfig) -> DestinationRegistry {
        DestinationRegistry {
            default_config,
            destinations: Default::default(),
        }
    }

    pub fn create(&self, name: &str, config: Option<DestinationConfig>) -> MqResult<Arc<Destination>> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        if config.max_failed_deliveries == 0 {
            return Err(MqError::incorrect_call("max failed deliveries must be at least 1"));
        }

        let mut destinations = self.destinations.lock().unwrap();
        if destinations.contains_key(name) {
            return Err(MqError::incorrect_call(format!("destination {} exists", name)));
        }
        debug!("creating destination {}", name);
        let destination = Destination::new(name, config);
        destinations.insert(name.to_string(), destination.clone());
        Ok(destination)
    }

    pub fn get(&self, name: &str) -> MqResult<Arc<Destination>> {
        self.destinations.lock().unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| MqError::incorrect_call(format!("no destination {}", name)))
    }

    pub fn all(&self) -> Vec<Arc<Destination>> {
        self.destinations.lock().unwrap().values().cloned().collect()
    }
}
