//! Lockable message delivery: destinations with per-message locks, consumer sessions that
//!  receive synchronously or through asynchronous callbacks, and the sessions built around them.
//!
//! A message is locked to at most one session at a time. Unlocking it makes it available
//!  again and counts as a failed delivery, deleting it removes it for good.

pub mod bifurcated;
pub mod browser;
pub mod consumer;
pub mod destination;
pub mod enumeration;
pub mod exception;
pub mod lock_expiry;
pub mod lock_table;
pub mod message;
pub mod producer;
