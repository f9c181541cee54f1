use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::delivery::destination::{AvailabilityListener, Destination};
use crate::delivery::enumeration::LockedMessageEnumeration;
use crate::delivery::exception::ExceptionListeners;
use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::dispatch::dispatcher::{DispatchKey, Dispatcher};
use crate::error::{ErrorKind, MqError, MqResult};
use crate::ordering::OrderingContext;
use crate::transaction::{DeleteParticipant, Transaction};

/// Receives batches of locked messages. The callback runs synchronously on a dispatcher task
///  and should not block for long.
pub trait AsyncConsumerCallback: Send + Sync + 'static {
    fn consume_messages(&self, messages: &mut LockedMessageEnumeration<'_>) -> anyhow::Result<()>;
}

pub trait StoppableAsyncConsumerCallback: AsyncConsumerCallback {
    /// the session was stopped because of too many sequential failures
    fn consumer_session_stopped(&self);
}

#[derive(Clone)]
enum RegisteredCallback {
    Plain(Arc<dyn AsyncConsumerCallback>),
    Stoppable(Arc<dyn StoppableAsyncConsumerCallback>),
}

impl RegisteredCallback {
    fn consume(&self, messages: &mut LockedMessageEnumeration<'_>) -> anyhow::Result<()> {
        match self {
            RegisteredCallback::Plain(c) => c.consume_messages(messages),
            RegisteredCallback::Stoppable(c) => c.consume_messages(messages),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncConsumerOptions {
    /// upper bound for messages locked to the session at any time, 0 for unlimited
    pub max_active_messages: usize,
    pub max_batch_size: usize,
    /// messages delivered to the callback are unlocked (with increment) if they are still
    ///  locked after this time
    pub message_lock_expiry: Option<Duration>,
    pub ordering_context: Option<Arc<OrderingContext>>,
}

impl AsyncConsumerOptions {
    pub fn new(max_batch_size: usize) -> AsyncConsumerOptions {
        AsyncConsumerOptions {
            max_active_messages: 0,
            max_batch_size,
            message_lock_expiry: None,
            ordering_context: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoppableOptions {
    /// 0 disables stopping the session
    pub max_sequential_failures: u32,
    pub hidden_message_delay: Duration,
}

struct Registration {
    callback: RegisteredCallback,
    options: AsyncConsumerOptions,
    stoppable: Option<StoppableOptions>,
}

impl Registration {
    fn effective_batch_size(&self) -> usize {
        match self.options.max_active_messages {
            0 => self.options.max_batch_size,
            max_active => self.options.max_batch_size.min(max_active),
        }
    }

    fn dispatch_key(&self, session: SessionId) -> DispatchKey {
        self.options.ordering_context.as_ref()
            .map(|o| o.dispatch_key())
            .unwrap_or(DispatchKey::Session(session.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnlockAllOutcome {
    pub unlocked: usize,
    /// messages whose redelivery count went up, including locks the session had already lost
    ///  to expiry or rollback
    pub incremented: usize,
}

struct ConsumerState {
    started: bool,
    closed: bool,
    registration: Option<Registration>,
    /// the thread running the callback while a batch is in progress
    callback_thread: Option<ThreadId>,
    batch_scheduled: bool,
    /// availability changed while a batch was running
    rerun_requested: bool,
    /// seen but unresolved messages of earlier batches
    retained: Vec<MessageHandle>,
    sequential_failures: u32,
    stop_notification_pending: bool,
}

impl ConsumerState {
    fn check_open(&self) -> MqResult<()> {
        if self.closed {
            return Err(MqError::new(ErrorKind::SessionUnavailable, "the consumer session is closed"));
        }
        Ok(())
    }

    fn is_callback_thread(&self) -> bool {
        self.callback_thread == Some(std::thread::current().id())
    }
}

pub(crate) struct ConsumerCore {
    id: SessionId,
    destination: Arc<Destination>,
    dispatcher: Dispatcher,
    exception_listeners: Arc<ExceptionListeners>,
    state: Mutex<ConsumerState>,
    /// start and close, for blocked synchronous receivers
    state_changed: Notify,
    myself: Weak<ConsumerCore>,
}

impl ConsumerCore {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    fn participant(&self) -> Option<Arc<dyn DeleteParticipant>> {
        self.myself.upgrade().map(|me| me as Arc<dyn DeleteParticipant>)
    }

    pub(crate) fn delete_one(&self, handle: MessageHandle, tran: Option<&Transaction>) -> MqResult<()> {
        match tran {
            Some(tran) => tran.delete_locked(&self.destination, handle, self.id, self.participant()),
            None => self.destination.delete(handle, self.id).map(|_| ()),
        }
    }

    pub(crate) fn take_retained(&self) -> Vec<MessageHandle> {
        std::mem::take(&mut self.state.lock().unwrap().retained)
    }

    pub(crate) fn restore_retained(&self, handles: &[MessageHandle]) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.retained.extend_from_slice(handles);
            state.retained.sort();
        }
    }

    pub(crate) fn forget_retained(&self, handles: &[MessageHandle]) {
        self.state.lock().unwrap().retained.retain(|h| !handles.contains(h));
    }

    fn schedule_delivery(&self) {
        let key = {
            let mut state = self.state.lock().unwrap();
            if !state.started || state.closed {
                return;
            }
            let key = match &state.registration {
                Some(r) => r.dispatch_key(self.id),
                None => return,
            };
            if state.callback_thread.is_some() {
                state.rerun_requested = true;
                return;
            }
            if state.batch_scheduled {
                return;
            }
            state.batch_scheduled = true;
            key
        };

        let Some(core) = self.myself.upgrade() else {
            return;
        };
        trace!(session = self.id.0, "scheduling a batch");
        self.dispatcher.submit(key, Box::pin(async move {
            core.run_batch();
        }));
    }

    /// Locks a batch, runs the callback on it and reconciles the enumeration afterwards
    fn run_batch(&self) {
        let (callback, batch_size, lock_expiry, ordering) = {
            let mut state = self.state.lock().unwrap();
            state.batch_scheduled = false;
            if !state.started || state.closed {
                return;
            }
            if state.callback_thread.is_some() {
                state.rerun_requested = true;
                return;
            }
            let Some(registration) = &state.registration else {
                return;
            };
            let callback = registration.callback.clone();
            let options = registration.options.clone();
            let stoppable = registration.stoppable;
            let mut batch_size = registration.effective_batch_size();

            let destination = &self.destination;
            let id = self.id;
            state.retained.retain(|h| destination.is_locked_to(*h, id));

            if options.max_active_messages > 0 {
                let active = state.retained.len();
                if active >= options.max_active_messages {
                    trace!(session = self.id.0, "{} active messages - not delivering", active);
                    return;
                }
                batch_size = batch_size.min(options.max_active_messages - active);
            }
            if let Some(stoppable) = stoppable.filter(|s| s.max_sequential_failures > 0) {
                let num_hidden = destination.num_hidden_by(id);
                let max_hidden = stoppable.max_sequential_failures as usize;
                if num_hidden >= max_hidden {
                    debug!(session = self.id.0, "{} hidden messages - suspending delivery", num_hidden);
                    return;
                }
                // keep the batch within the room left for hidden messages once hiding has started
                if num_hidden > 0 && batch_size > max_hidden - num_hidden {
                    batch_size = max_hidden - num_hidden;
                    trace!(session = self.id.0, "{} hidden messages - cropped the batch to {}", num_hidden, batch_size);
                }
            }

            state.callback_thread = Some(std::thread::current().id());
            (callback, batch_size, options.message_lock_expiry, options.ordering_context)
        };

        let ordering_guard = ordering.as_ref().map(|o| o.enter());
        let expiry = lock_expiry.map(|d| Instant::now() + d);
        let messages = self.destination.lock_batch(self.id, batch_size, expiry);
        let delivered = !messages.is_empty();

        if delivered {
            debug!(session = self.id.0, "delivering a batch of {} messages", messages.len());
            let mut enumeration = LockedMessageEnumeration::new(self, messages);
            let failure = match catch_unwind(AssertUnwindSafe(|| callback.consume(&mut enumeration))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if failure.is_some() {
                enumeration.unlock_current_after_failure();
            }

            let (unseen, retained) = enumeration.finish();
            self.destination.unlock_if_locked(&unseen, self.id, false);
            self.restore_retained(&retained);

            if let Some(failure) = failure {
                warn!(session = self.id.0, "asynchronous consumer callback failed: {}", failure);
                let error = MqError::new(ErrorKind::Resource, format!("asynchronous consumer callback failed: {}", failure));
                self.exception_listeners.report(self.id, &error);
            }
        }
        drop(ordering_guard);

        let rerun = {
            let mut state = self.state.lock().unwrap();
            state.callback_thread = None;
            std::mem::take(&mut state.rerun_requested) || delivered
        };
        if rerun {
            self.schedule_delivery();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic.downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "callback panicked".to_string())
}

impl AvailabilityListener for ConsumerCore {
    fn messages_available(&self) {
        self.schedule_delivery();
    }
}

impl DeleteParticipant for ConsumerCore {
    fn delete_rolled_back(&self, handle: MessageHandle, redelivery_count: u32) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }
        let stoppable = state.registration.as_ref().and_then(|r| r.stoppable)?;

        let max_failed = self.destination.config().max_failed_deliveries;
        let delivery_count = redelivery_count + 1;
        if max_failed == 1 || delivery_count == max_failed - 1 {
            state.sequential_failures += 1;
            debug!(session = self.id.0, "{:?} failed, {} sequential failures", handle, state.sequential_failures);

            if stoppable.max_sequential_failures > 0 && state.sequential_failures >= stoppable.max_sequential_failures {
                info!(session = self.id.0, "stopping the session after {} sequential failures", state.sequential_failures);
                state.started = false;
                state.sequential_failures = 0;
                state.stop_notification_pending = true;
                return None;
            }
        }

        if delivery_count < max_failed && !stoppable.hidden_message_delay.is_zero() {
            trace!(session = self.id.0, "hiding {:?} for {:?}", handle, stoppable.hidden_message_delay);
            return Some(stoppable.hidden_message_delay);
        }
        None
    }

    fn delete_committed(&self, _handle: MessageHandle) {
        self.state.lock().unwrap().sequential_failures = 0;
    }

    fn rollback_completed(&self) {
        let stopped_callback = {
            let mut state = self.state.lock().unwrap();
            if !std::mem::take(&mut state.stop_notification_pending) {
                return;
            }
            match state.registration.as_ref().map(|r| &r.callback) {
                Some(RegisteredCallback::Stoppable(c)) => Some(c.clone()),
                _ => None,
            }
        };
        self.destination.release_hidden_by(self.id);
        if let Some(callback) = stopped_callback {
            callback.consumer_session_stopped();
        }
    }
}

/// Consumes messages from one destination, either through synchronous receives or through a
///  registered asynchronous callback.
#[derive(Clone)]
pub struct ConsumerSession {
    core: Arc<ConsumerCore>,
}

impl std::fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSession").field("id", &self.core.id).finish_non_exhaustive()
    }
}

impl ConsumerSession {
    pub(crate) fn new(id: SessionId, destination: Arc<Destination>, dispatcher: Dispatcher, exception_listeners: Arc<ExceptionListeners>) -> ConsumerSession {
        let core = Arc::new_cyclic(|myself| ConsumerCore {
            id,
            destination,
            dispatcher,
            exception_listeners,
            state: Mutex::new(ConsumerState {
                started: false,
                closed: false,
                registration: None,
                callback_thread: None,
                batch_scheduled: false,
                rerun_requested: false,
                retained: Vec::new(),
                sequential_failures: 0,
                stop_notification_pending: false,
            }),
            state_changed: Notify::new(),
            myself: myself.clone(),
        });

        let listener: Weak<dyn AvailabilityListener> = Arc::downgrade(&(core.clone() as Arc<dyn AvailabilityListener>));
        core.destination.subscribe(id, listener);
        ConsumerSession { core }
    }

    pub(crate) fn core(&self) -> &Arc<ConsumerCore> {
        &self.core
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub(crate) fn exception_listeners(&self) -> &Arc<ExceptionListeners> {
        &self.core.exception_listeners
    }

    pub fn destination(&self) -> &Arc<Destination> {
        &self.core.destination
    }

    pub fn is_started(&self) -> bool {
        self.core.state.lock().unwrap().started
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.lock().unwrap().closed
    }

    pub fn has_async_callback(&self) -> bool {
        self.core.state.lock().unwrap().registration.is_some()
    }

    pub fn register_async_consumer_callback(&self, callback: Arc<dyn AsyncConsumerCallback>, options: AsyncConsumerOptions) -> MqResult<()> {
        self.register(RegisteredCallback::Plain(callback), options, None)
    }

    pub fn register_stoppable_async_consumer_callback(&self, callback: Arc<dyn StoppableAsyncConsumerCallback>, options: AsyncConsumerOptions, stoppable: StoppableOptions) -> MqResult<()> {
        self.register(RegisteredCallback::Stoppable(callback), options, Some(stoppable))
    }

    fn register(&self, callback: RegisteredCallback, options: AsyncConsumerOptions, stoppable: Option<StoppableOptions>) -> MqResult<()> {
        if options.max_batch_size == 0 {
            return Err(MqError::incorrect_call("max batch size must be at least 1"));
        }

        let mut state = self.core.state.lock().unwrap();
        state.check_open()?;
        if state.started {
            return Err(MqError::incorrect_call("a callback can only be registered while the session is stopped"));
        }
        if state.is_callback_thread() {
            return Err(MqError::incorrect_call("a callback cannot be registered from inside the callback"));
        }

        let stoppable = stoppable.map(|s| self.effective_stoppable_options(&options, s));
        debug!(session = self.core.id.0, "registering {} callback, effective batch size {}",
            if stoppable.is_some() { "stoppable" } else { "asynchronous" },
            match options.max_active_messages { 0 => options.max_batch_size, n => n.min(options.max_batch_size) });
        state.registration = Some(Registration { callback, options, stoppable });
        state.sequential_failures = 0;
        Ok(())
    }

    /// An ordered consumer, or one on a destination without an exception list, stops at the
    ///  first message that reaches its redelivery limit. A consumer that never stops does not
    ///  hide messages.
    fn effective_stoppable_options(&self, options: &AsyncConsumerOptions, mut stoppable: StoppableOptions) -> StoppableOptions {
        if stoppable.max_sequential_failures > 1
            && (options.ordering_context.is_some() || !self.core.destination.config().exception_list)
        {
            debug!(session = self.core.id.0, "max sequential failures {} reduced to 1", stoppable.max_sequential_failures);
            stoppable.max_sequential_failures = 1;
        }
        if stoppable.max_sequential_failures == 0 {
            stoppable.hidden_message_delay = Duration::ZERO;
        }
        stoppable
    }

    pub fn deregister_async_consumer_callback(&self) -> MqResult<()> {
        let mut state = self.core.state.lock().unwrap();
        state.check_open()?;
        if state.started {
            return Err(MqError::incorrect_call("a callback can only be deregistered while the session is stopped"));
        }
        if state.is_callback_thread() {
            return Err(MqError::incorrect_call("a callback cannot deregister itself"));
        }
        state.registration = None;
        Ok(())
    }

    /// Starts delivery. With a registered callback and `deliver_immediately`, the first batch
    ///  runs on the calling thread before this returns.
    pub fn start(&self, deliver_immediately: bool) -> MqResult<()> {
        let has_callback = {
            let mut state = self.core.state.lock().unwrap();
            state.check_open()?;
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.registration.is_some()
        };
        debug!(session = self.core.id.0, "started");
        self.core.state_changed.notify_waiters();

        if has_callback {
            if deliver_immediately {
                self.core.run_batch();
            }
            else {
                self.core.schedule_delivery();
            }
        }
        Ok(())
    }

    /// Stops delivery. A callback in progress completes, but no further batch starts. Blocked
    ///  synchronous receives are not woken.
    pub fn stop(&self) -> MqResult<()> {
        let mut state = self.core.state.lock().unwrap();
        state.check_open()?;
        state.started = false;
        debug!(session = self.core.id.0, "stopped");
        Ok(())
    }

    /// Without a transaction the message is removed right away. With a transaction it is
    ///  deleted when the transaction commits.
    pub fn receive_no_wait(&self, tran: Option<&Transaction>) -> MqResult<Option<Message>> {
        {
            let state = self.core.state.lock().unwrap();
            state.check_open()?;
            if state.registration.is_some() {
                return Err(MqError::incorrect_call("synchronous receive while an asynchronous callback is registered"));
            }
            if let Some(tran) = tran {
                tran.check_active()?;
            }
            if !state.started {
                return Ok(None);
            }
        }

        let Some(tran) = tran else {
            return Ok(self.core.destination.take_next());
        };

        let Some(message) = self.core.destination.lock_next(self.core.id) else {
            return Ok(None);
        };
        if let Err(e) = tran.delete_locked(&self.core.destination, message.handle, self.core.id, self.core.participant()) {
            self.core.destination.unlock_if_locked(&[message.handle], self.core.id, false);
            return Err(e);
        }
        Ok(Some(message))
    }

    /// Waits up to `timeout` for a message, a zero timeout waits indefinitely. Closing the
    ///  session fails a waiting receive with SessionDropped.
    pub async fn receive_with_wait(&self, timeout: Duration, tran: Option<&Transaction>) -> MqResult<Option<Message>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let available = self.core.destination.available_notified();
            let state_changed = self.core.state_changed.notified();
            tokio::pin!(available);
            tokio::pin!(state_changed);
            available.as_mut().enable();
            state_changed.as_mut().enable();

            if let Some(message) = self.receive_no_wait(tran)? {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = &mut available => {}
                _ = &mut state_changed => {}
                _ = sleep_until(deadline) => return Ok(None),
            }
            if self.is_closed() {
                return Err(MqError::new(ErrorKind::SessionDropped, "the session was closed during a receive"));
            }
        }
    }

    /// Deletes the messages in order. On failure, the error carries the handles that were
    ///  deleted before it.
    pub fn delete_set(&self, handles: &[MessageHandle], tran: Option<&Transaction>) -> MqResult<()> {
        self.core.state.lock().unwrap().check_open()?;
        if let Some(tran) = tran {
            tran.check_active()?;
        }

        let mut succeeded = Vec::new();
        let mut result = Ok(());
        for handle in handles {
            if let Err(e) = self.core.delete_one(*handle, tran) {
                result = Err(e);
                break;
            }
            succeeded.push(*handle);
        }
        self.core.forget_retained(&succeeded);
        // resolved messages may free up room under the active message limit
        self.core.schedule_delivery();
        result.map_err(|e| e.with_succeeded(succeeded))
    }

    pub fn unlock_set(&self, handles: &[MessageHandle]) -> MqResult<()> {
        self.unlock_set_with(handles, true)
    }

    pub fn unlock_set_with(&self, handles: &[MessageHandle], increment: bool) -> MqResult<()> {
        self.core.state.lock().unwrap().check_open()?;

        let mut succeeded = Vec::new();
        let mut result = Ok(());
        for handle in handles {
            if let Err(e) = self.core.destination.unlock(*handle, self.core.id, increment) {
                result = Err(e);
                break;
            }
            succeeded.push(*handle);
        }
        self.core.forget_retained(&succeeded);
        result.map_err(|e| e.with_succeeded(succeeded))
    }

    pub fn unlock_all(&self) -> MqResult<UnlockAllOutcome> {
        self.unlock_all_with(true)
    }

    /// Unlocks everything locked to the session. Not incrementing is best-effort: locks that
    ///  were lost to expiry or rollback before the call were incremented already.
    pub fn unlock_all_with(&self, increment: bool) -> MqResult<UnlockAllOutcome> {
        let retained = {
            let mut state = self.core.state.lock().unwrap();
            state.check_open()?;
            std::mem::take(&mut state.retained)
        };
        let lost = retained.iter()
            .filter(|h| !self.core.destination.is_locked_to(**h, self.core.id))
            .filter(|h| self.core.destination.message(**h).is_some())
            .count();

        let unlocked = self.core.destination.unlock_all(self.core.id, increment);
        let outcome = UnlockAllOutcome {
            unlocked,
            incremented: if increment { unlocked } else { 0 } + lost,
        };
        debug!(session = self.core.id.0, "unlock all: {:?}", outcome);
        Ok(outcome)
    }

    /// Unlocks (with increment) every message still locked to the session. Further calls fail
    ///  with SessionUnavailable.
    pub fn close(&self) -> MqResult<()> {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.started = false;
            state.registration = None;
            state.retained.clear();
        }
        self.core.state_changed.notify_waiters();
        self.core.destination.unsubscribe(self.core.id);

        let num_unlocked = self.core.destination.unlock_all(self.core.id, true);
        self.core.destination.release_hidden_by(self.core.id);
        debug!(session = self.core.id.0, "closed, unlocked {} messages", num_unlocked);
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
