//! Helpers shared by the tests of connections and delivery: in-memory connection pairs,
//!  recording listeners and callbacks, and pre-filled destinations.
//!
//! They are part of the crate's regular code so that applications can use them for their own
//!  tests.

pub mod connection;
pub mod delivery;
