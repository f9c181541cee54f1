use std::sync::Weak;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::connection::physical::PhysicalConnection;
use crate::error::MqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Nothing,
    SendHeartbeat,
    TimedOut,
}

/// Tracks inbound activity on a connection. This is pure bookkeeping, the timer lives in
///  [run_heartbeat_loop].
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_received: Instant,
    heartbeat_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor {
            interval,
            timeout,
            last_received: now,
            heartbeat_sent_at: None,
        }
    }

    pub fn set_timing(&mut self, interval: Duration, timeout: Duration) {
        self.interval = interval;
        self.timeout = timeout;
    }

    /// Any inbound data proves the peer is alive, not only a heartbeat response
    pub fn on_data_received(&mut self, now: Instant) {
        self.last_received = now;
        self.heartbeat_sent_at = None;
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent_at) = self.heartbeat_sent_at {
            if now.saturating_duration_since(sent_at) >= self.timeout {
                return HeartbeatAction::TimedOut;
            }
            return HeartbeatAction::Nothing;
        }

        if !self.interval.is_zero() && now.saturating_duration_since(self.last_received) >= self.interval {
            self.heartbeat_sent_at = Some(now);
            return HeartbeatAction::SendHeartbeat;
        }
        HeartbeatAction::Nothing
    }
}

/// Periodically checks a connection for inactivity. The loop holds only a weak reference, so it
///  does not keep a connection alive, and it ends when the connection is invalidated.
pub async fn run_heartbeat_loop(connection: Weak<PhysicalConnection>, check_interval: Duration) {
    loop {
        sleep(check_interval).await;

        let Some(connection) = connection.upgrade() else {
            trace!("connection is gone - stopping heartbeat loop");
            break;
        };
        if connection.is_invalidated() {
            debug!("connection {} is invalidated - stopping heartbeat loop", connection.id());
            break;
        }

        match connection.poll_heartbeat(Instant::now()) {
            HeartbeatAction::Nothing => {}
            HeartbeatAction::SendHeartbeat => {
                trace!("connection {} is idle - sending heartbeat", connection.id());
                connection.send_heartbeat();
            }
            HeartbeatAction::TimedOut => {
                warn!("no heartbeat response on connection {} - invalidating", connection.id());
                connection.invalidate(true, MqError::connection_lost("heartbeat timed out"));
                break;
            }
        }
    }
}
