use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::config::DestinationConfig;
use crate::delivery::consumer::{AsyncConsumerCallback, ConsumerSession, StoppableAsyncConsumerCallback};
use crate::delivery::destination::Destination;
use crate::delivery::enumeration::LockedMessageEnumeration;
use crate::delivery::exception::ExceptionListeners;
use crate::delivery::message::{MessageHandle, SessionId};
use crate::dispatch::dispatcher::Dispatcher;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A destination holding `num_messages` messages with payloads "m0", "m1", ...
pub fn test_destination(num_messages: usize, config: DestinationConfig) -> Arc<Destination> {
    let destination = Destination::new("test", config);
    for i in 0..num_messages {
        destination.put(Bytes::from(format!("m{}", i)))
            .expect("test destination is too small");
    }
    destination
}

pub fn consumer_session(destination: &Arc<Destination>, dispatcher: Dispatcher) -> ConsumerSession {
    let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
    ConsumerSession::new(id, destination.clone(), dispatcher, Arc::new(ExceptionListeners::default()))
}

type Behavior = Box<dyn Fn(&mut LockedMessageEnumeration<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A (stoppable) consumer callback that records the batches it is given and delegates to a
///  closure
pub struct RecordingCallback {
    behavior: Behavior,
    batches: Mutex<Vec<Vec<MessageHandle>>>,
    num_stopped: AtomicUsize,
}

impl RecordingCallback {
    pub fn new(behavior: impl Fn(&mut LockedMessageEnumeration<'_>) -> anyhow::Result<()> + Send + Sync + 'static) -> Arc<RecordingCallback> {
        Arc::new(RecordingCallback {
            behavior: Box::new(behavior),
            batches: Default::default(),
            num_stopped: AtomicUsize::new(0),
        })
    }

    /// deletes every message it is given
    pub fn consuming() -> Arc<RecordingCallback> {
        Self::new(|messages| {
            while messages.next_locked()?.is_some() {
                messages.delete_current(None)?;
            }
            Ok(())
        })
    }

    pub fn batches(&self) -> Vec<Vec<MessageHandle>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn num_messages(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }

    pub fn num_stopped(&self) -> usize {
        self.num_stopped.load(Ordering::SeqCst)
    }

    pub async fn wait_for_messages(&self, n: usize) {
        let result = timeout(Duration::from_secs(5), async {
            while self.num_messages() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await;
        assert!(result.is_ok(), "expected {} delivered messages, got {}", n, self.num_messages());
    }

    pub async fn wait_for_stopped(&self, n: usize) {
        let result = timeout(Duration::from_secs(5), async {
            while self.num_stopped() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await;
        assert!(result.is_ok(), "expected {} stop notifications, got {}", n, self.num_stopped());
    }
}

impl AsyncConsumerCallback for RecordingCallback {
    fn consume_messages(&self, messages: &mut LockedMessageEnumeration<'_>) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(messages.message_handles());
        (self.behavior)(messages)
    }
}

impl StoppableAsyncConsumerCallback for RecordingCallback {
    fn consumer_session_stopped(&self) {
        self.num_stopped.fetch_add(1, Ordering::SeqCst);
    }
}
