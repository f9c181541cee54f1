use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::connection::listener::SendListener;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::wire::framer::Transmission;
use crate::wire::priority::Priority;

/// What a send does when the connection's outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlingPolicy {
    /// wait until there is room
    BlockThread,
    /// drop the transmission and tell the send listener
    DiscardTransmission,
    /// bypass the byte budget. Reserved for the connection's own control flows.
    DoNotThrottle,
}

pub struct QueuedTransmission {
    pub transmission: Transmission,
    pub send_listener: Option<Arc<dyn SendListener>>,
    /// returns the transmission's share of the byte budget when dropped
    _permit: Option<OwnedSemaphorePermit>,
}

struct QueueState {
    levels: Vec<VecDeque<QueuedTransmission>>,
    closed: bool,
    /// written after everything else, once the queue is closed
    final_transmission: Option<Transmission>,
}

/// A connection's outbound queue: one FIFO per priority level, drained highest priority first by
///  the connection's single writer task. Its size is bounded in bytes.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    budget: Arc<Semaphore>,
    max_queued_bytes: usize,
}

impl OutboundQueue {
    pub fn new(max_queued_bytes: usize) -> OutboundQueue {
        OutboundQueue {
            state: Mutex::new(QueueState {
                levels: (0..Priority::NUM_LEVELS).map(|_| VecDeque::new()).collect(),
                closed: false,
                final_transmission: None,
            }),
            notify: Notify::new(),
            budget: Arc::new(Semaphore::new(max_queued_bytes)),
            max_queued_bytes,
        }
    }

    /// Returns `Ok(false)` if the transmission was discarded by throttling
    pub async fn enqueue(&self, transmission: Transmission, send_listener: Option<Arc<dyn SendListener>>, policy: ThrottlingPolicy) -> MqResult<bool> {
        let cost = transmission.payload.len()
            .min(self.max_queued_bytes)
            .min(u32::MAX as usize) as u32;

        let permit = match policy {
            ThrottlingPolicy::DoNotThrottle => None,
            ThrottlingPolicy::BlockThread => {
                let permit = self.budget.clone().acquire_many_owned(cost).await
                    .map_err(|_| MqError::connection_dropped("the connection was closed while waiting for queue space"))?;
                Some(permit)
            }
            ThrottlingPolicy::DiscardTransmission => {
                match self.budget.clone().try_acquire_many_owned(cost) {
                    Ok(permit) => Some(permit),
                    Err(TryAcquireError::NoPermits) => {
                        debug!(conversation_id = transmission.conversation_id, "outbound queue is full - discarding {} bytes", cost);
                        if let Some(listener) = &send_listener {
                            listener.error_occurred(MqError::new(ErrorKind::LimitExceeded, "transmission discarded by throttling"), transmission.conversation_id);
                        }
                        return Ok(false);
                    }
                    Err(TryAcquireError::Closed) => return Err(MqError::connection_dropped("the connection is closed")),
                }
            }
        };

        self.push(QueuedTransmission {
            transmission,
            send_listener,
            _permit: permit,
        })?;
        Ok(true)
    }

    /// For the connection's control flows (heartbeats, close, ping responses), never throttled
    pub fn enqueue_internal(&self, transmission: Transmission) -> MqResult<()> {
        self.push(QueuedTransmission {
            transmission,
            send_listener: None,
            _permit: None,
        })
    }

    fn push(&self, item: QueuedTransmission) -> MqResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(MqError::connection_dropped("the connection is closed"));
            }
            state.levels[item.transmission.priority.index()].push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// The lowest priority of this conversation's queued transmissions, if any
    pub fn lowest_queued_priority(&self, conversation_id: u16) -> Option<Priority> {
        let state = self.state.lock().unwrap();
        state.levels.iter()
            .flat_map(|level| level.iter())
            .filter(|q| q.transmission.conversation_id == conversation_id)
            .map(|q| q.transmission.priority)
            .min()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().levels.iter()
            .map(|l| l.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next transmission to write. Returns `None` once the queue is closed and its
    ///  final transmission (if any) was handed out.
    ///
    /// There must be only one task calling this.
    pub async fn next(&self) -> Option<QueuedTransmission> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.levels.iter_mut().rev().find_map(|l| l.pop_front()) {
                    return Some(item);
                }
                if state.closed {
                    return state.final_transmission.take()
                        .map(|transmission| QueuedTransmission {
                            transmission,
                            send_listener: None,
                            _permit: None,
                        });
                }
            }
            self.notify.notified().await;
        }
    }

    /// Closes the queue for further transmissions. With `flush`, everything already queued is
    ///  still written, otherwise it is returned to the caller. Closing twice has no effect.
    pub fn close(&self, final_transmission: Option<Transmission>, flush: bool) -> Vec<QueuedTransmission> {
        let dropped = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            state.final_transmission = final_transmission;
            if flush {
                Vec::new()
            }
            else {
                state.levels.iter_mut()
                    .flat_map(|l| l.drain(..))
                    .collect::<Vec<_>>()
            }
        };
        self.budget.close();
        self.notify.notify_one();
        dropped
    }
}
