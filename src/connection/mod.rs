//! Physical connections, the conversations multiplexed over them, and the tracker that pools
//!  connections per endpoint.
//!
//! A [physical::PhysicalConnection] owns one byte stream. Its first conversation carries the
//!  handshake; later conversations stay pending until the handshake gate opens. Each
//!  [conversation::Conversation] offers one-way sends, request/reply exchanges, pings and an
//!  orderly logical close.

pub mod conversation;
pub mod handshake;
pub mod heartbeat;
pub mod listener;
pub mod physical;
pub mod request_table;
pub mod send_queue;
pub mod socket;
pub mod tracker;
