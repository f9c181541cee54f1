use std::fmt::{Debug, Formatter};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use crate::dispatch::dispatcher::DispatchKey;

struct GateOwner {
    thread: ThreadId,
    depth: usize,
}

/// Shared by consumer sessions and producers that need their work strictly serialized: at most
///  one batch or send of all participants is in flight at any time.
///
/// The gate is re-entrant for the thread holding it, so a callback can send through a producer
///  on the same ordering context.
pub struct OrderingContext {
    id: u64,
    owner: Mutex<Option<GateOwner>>,
    released: Condvar,
}

impl Debug for OrderingContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderingContext({})", self.id)
    }
}

pub struct OrderingGuard<'a> {
    context: &'a OrderingContext,
}

impl Drop for OrderingGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.context.owner.lock().unwrap();
        if let Some(o) = owner.as_mut() {
            debug_assert!(o.depth > 0, "ordering guard dropped more often than acquired");
            o.depth = o.depth.saturating_sub(1);
            if o.depth == 0 {
                *owner = None;
                self.context.released.notify_one();
            }
        }
    }
}

impl OrderingContext {
    pub fn new(id: u64) -> OrderingContext {
        OrderingContext {
            id,
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey::Ordering(self.id)
    }

    pub fn is_held(&self) -> bool {
        self.owner.lock().unwrap().is_some()
    }

    /// Blocks until the gate is free (or held by the current thread). Critical sections are
    ///  synchronous callbacks and sends, so waiting is short.
    pub fn enter(&self) -> OrderingGuard<'_> {
        let current = std::thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        loop {
            match owner.as_mut() {
                None => {
                    *owner = Some(GateOwner { thread: current, depth: 1 });
                    break;
                }
                Some(o) if o.thread == current => {
                    o.depth += 1;
                    break;
                }
                Some(_) => {
                    owner = self.released.wait(owner).unwrap();
                }
            }
        }
        OrderingGuard { context: self }
    }
}
