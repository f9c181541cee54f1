use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, trace};

pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Identifies a unit of work's queue: all work for the same key is processed strictly in
///  submission order, work for different keys may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Conversation { connection_id: u64, conversation_id: u16 },
    Transaction(u64),
    Session(u64),
    Ordering(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// run on the calling task without a task switch - lowest latency, but it blocks the caller
    ///  (typically the connection's read loop) for the duration of the work
    Inline,
    /// run after everything currently queued on any queue, on whichever queue gets there last
    Broadcast,
    Affinity(DispatchKey),
}

struct Queue {
    sender: mpsc::UnboundedSender<Work>,
    /// number of items submitted and not yet finished
    outstanding: usize,
}

struct DispatcherInner {
    runtime: Handle,
    queues: Mutex<FxHashMap<DispatchKey, Queue>>,
    workers: Semaphore,
}

/// Runs inbound work on tokio tasks, with per-key queues. A queue exists only while it has
///  outstanding work, and at most `max_workers` items run at the same time across all queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(runtime: Handle, max_workers: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                runtime,
                queues: Default::default(),
                workers: Semaphore::new(max_workers),
            }),
        }
    }

    pub async fn dispatch(&self, strategy: DispatchStrategy, work: Work) {
        match strategy {
            DispatchStrategy::Inline => work.await,
            DispatchStrategy::Broadcast => self.submit_broadcast(work),
            DispatchStrategy::Affinity(key) => self.submit(key, work),
        }
    }

    /// Queues work without waiting for it, usable from synchronous code
    pub fn submit(&self, key: DispatchKey, work: Work) {
        let mut queues = self.inner.queues.lock().unwrap();
        Self::enqueue(&self.inner, &mut queues, key, work);
    }

    pub fn submit_broadcast(&self, work: Work) {
        let mut queues = self.inner.queues.lock().unwrap();

        let keys = queues.keys().copied().collect::<Vec<_>>();
        if keys.is_empty() {
            trace!("broadcast with no busy queues - running on a fresh task");
            drop(queues);
            self.inner.runtime.spawn(work);
            return;
        }

        trace!("broadcast behind {} queues", keys.len());
        let barrier = Arc::new(BroadcastBarrier {
            remaining: AtomicUsize::new(keys.len()),
            work: Mutex::new(Some(work)),
        });
        for key in keys {
            let barrier = barrier.clone();
            Self::enqueue(&self.inner, &mut queues, key, Box::pin(async move {
                barrier.arrive().await;
            }));
        }
    }

    /// number of unfinished items for a key
    pub fn outstanding(&self, key: DispatchKey) -> usize {
        self.inner.queues.lock().unwrap()
            .get(&key)
            .map(|q| q.outstanding)
            .unwrap_or(0)
    }

    pub fn num_queues(&self) -> usize {
        self.inner.queues.lock().unwrap().len()
    }

    fn enqueue(inner: &Arc<DispatcherInner>, queues: &mut FxHashMap<DispatchKey, Queue>, key: DispatchKey, work: Work) {
        let work = match queues.get_mut(&key) {
            Some(queue) => {
                match queue.sender.send(work) {
                    Ok(()) => {
                        queue.outstanding += 1;
                        return;
                    }
                    Err(mpsc::error::SendError(work)) => {
                        error!("worker for {:?} terminated unexpectedly - starting a new one", key);
                        queues.remove(&key);
                        work
                    }
                }
            }
            None => work,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // the receiver is alive, so this can not fail
        let _ = sender.send(work);
        queues.insert(key, Queue { sender, outstanding: 1 });
        Self::spawn_worker(inner.clone(), key, receiver);
    }

    fn spawn_worker(inner: Arc<DispatcherInner>, key: DispatchKey, mut receiver: mpsc::UnboundedReceiver<Work>) {
        trace!("starting worker for {:?}", key);
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            while let Some(work) = receiver.recv().await {
                {
                    let _permit = inner.workers.acquire().await.ok();
                    // a separate task so that a panic in the work does not kill the queue
                    if let Err(e) = inner.runtime.spawn(work).await {
                        error!("dispatched work for {:?} failed: {}", key, e);
                    }
                }

                let mut queues = inner.queues.lock().unwrap();
                if let Entry::Occupied(mut e) = queues.entry(key) {
                    e.get_mut().outstanding -= 1;
                    if e.get().outstanding == 0 {
                        trace!("queue for {:?} is drained - releasing it", key);
                        e.remove();
                        break;
                    }
                }
            }
        });
    }
}

struct BroadcastBarrier {
    remaining: AtomicUsize,
    work: Mutex<Option<Work>>,
}

impl BroadcastBarrier {
    async fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let work = self.work.lock().unwrap().take();
            if let Some(work) = work {
                work.await;
            }
        }
    }
}
