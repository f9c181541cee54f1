use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::error::{MqError, MqResult};
use crate::wire::framer::Transmission;
use crate::wire::priority::Priority;
use crate::wire::segment_type::SegmentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCorrelation {
    pub request_number: u16,
    pub priority: Priority,
    pub segment_type: SegmentType,
}

struct Outstanding {
    correlation: RequestCorrelation,
    reply: oneshot::Sender<MqResult<Transmission>>,
}

/// Outstanding exchanges of one conversation, keyed by request number
#[derive(Default)]
pub struct RequestTable {
    outstanding: FxHashMap<u16, Outstanding>,
}

impl RequestTable {
    pub fn contains(&self, request_number: u16) -> bool {
        self.outstanding.contains_key(&request_number)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn get(&self, request_number: u16) -> Option<RequestCorrelation> {
        self.outstanding.get(&request_number).map(|o| o.correlation)
    }

    pub fn register(&mut self, correlation: RequestCorrelation) -> MqResult<oneshot::Receiver<MqResult<Transmission>>> {
        if correlation.request_number == 0 {
            return Err(MqError::incorrect_call("request number 0 is reserved for transmissions without a reply"));
        }
        if self.contains(correlation.request_number) {
            return Err(MqError::incorrect_call(format!("request number {} is already outstanding", correlation.request_number)));
        }

        let (reply, receiver) = oneshot::channel();
        self.outstanding.insert(correlation.request_number, Outstanding { correlation, reply });
        Ok(receiver)
    }

    /// returns `false` if there was no such request
    pub fn complete(&mut self, request_number: u16, result: MqResult<Transmission>) -> bool {
        match self.outstanding.remove(&request_number) {
            Some(o) => {
                // the waiter may have gone away, which is fine
                let _ = o.reply.send(result);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, request_number: u16) {
        self.outstanding.remove(&request_number);
    }

    pub fn fail_all(&mut self, error: &MqError) -> usize {
        let num_failed = self.outstanding.len();
        for (_, o) in self.outstanding.drain() {
            let _ = o.reply.send(Err(error.clone()));
        }
        num_failed
    }
}
