use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::delivery::message::SessionId;
use crate::error::MqError;

#[cfg_attr(test, mockall::automock)]
pub trait AsyncExceptionListener: Send + Sync + 'static {
    /// a failure on a session that has no synchronous caller to report it to, e.g. an error
    ///  escaping an asynchronous consumer callback
    fn asynchronous_exception(&self, session: SessionId, error: &MqError);
}

#[derive(Default)]
pub struct ExceptionListeners {
    listeners: Mutex<Vec<Arc<dyn AsyncExceptionListener>>>,
}

impl ExceptionListeners {
    pub fn add(&self, listener: Arc<dyn AsyncExceptionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn report(&self, session: SessionId, error: &MqError) {
        let listeners = self.listeners.lock().unwrap().clone();
        if listeners.is_empty() {
            warn!("asynchronous failure on {:?} with no exception listener: {}", session, error);
        }
        for listener in listeners {
            listener.asynchronous_exception(session, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_report_to_all() {
        let listeners = ExceptionListeners::default();
        for _ in 0..2 {
            let mut listener = MockAsyncExceptionListener::new();
            listener.expect_asynchronous_exception()
                .withf(|session, error| *session == SessionId(3) && error.kind == ErrorKind::Resource)
                .once()
                .return_const(());
            listeners.add(Arc::new(listener));
        }
        listeners.report(SessionId(3), &MqError::new(ErrorKind::Resource, "callback failed"));
    }

    #[test]
    fn test_report_without_listeners() {
        let listeners = ExceptionListeners::default();
        listeners.report(SessionId(1), &MqError::new(ErrorKind::Resource, "ignored"));
    }
}
