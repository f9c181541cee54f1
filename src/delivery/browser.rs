use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::delivery::destination::Destination;
use crate::delivery::message::{Message, MessageHandle, SessionId};
use crate::error::{ErrorKind, MqError, MqResult};

/// Reads messages without locking or removing them, in arrival order. Locked messages are
///  included, messages being deleted under a transaction are not.
pub struct BrowserSession {
    id: SessionId,
    destination: Arc<Destination>,
    cursor: Mutex<Option<MessageHandle>>,
    closed: AtomicBool,
}

impl BrowserSession {
    pub(crate) fn new(id: SessionId, destination: Arc<Destination>) -> BrowserSession {
        BrowserSession {
            id,
            destination,
            cursor: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn check_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::new(ErrorKind::SessionUnavailable, "the browser session is closed"));
        }
        Ok(())
    }

    pub fn next(&self) -> MqResult<Option<Message>> {
        self.check_open()?;
        let mut cursor = self.cursor.lock().unwrap();
        let next = self.destination.browse_after(*cursor);
        if let Some(message) = &next {
            *cursor = Some(message.handle);
        }
        Ok(next)
    }

    /// starts over at the oldest message
    pub fn reset(&self) -> MqResult<()> {
        self.check_open()?;
        *self.cursor.lock().unwrap() = None;
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::config::DestinationConfig;
    use crate::test_util::delivery::test_destination;

    #[test]
    fn test_browse() {
        let destination = test_destination(3, DestinationConfig::default());
        destination.lock_batch(SessionId(1), 1, None);
        let browser = BrowserSession::new(SessionId(2), destination.clone());

        let payloads = std::iter::from_fn(|| browser.next().unwrap())
            .map(|m| m.payload)
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![Bytes::from_static(b"m0"), Bytes::from_static(b"m1"), Bytes::from_static(b"m2")]);
        // browsing neither locks nor removes
        assert_eq!(destination.depth(), 3);
        assert_eq!(destination.num_available(), 2);

        // new messages show up behind the cursor
        destination.put(Bytes::from_static(b"m3")).unwrap();
        assert_eq!(browser.next().unwrap().unwrap().payload, Bytes::from_static(b"m3"));
        assert!(browser.next().unwrap().is_none());

        browser.reset().unwrap();
        assert_eq!(browser.next().unwrap().unwrap().payload, Bytes::from_static(b"m0"));

        browser.close();
        assert_eq!(browser.next().unwrap_err().kind, ErrorKind::SessionUnavailable);
    }
}
