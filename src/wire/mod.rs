//! Binary framing of transmissions on a physical connection. All numbers are in network byte
//!  order (BE).
//!
//! ```ascii
//! primary header (10 bytes, every frame)
//!  0: eyecatcher (u16) 0xBEEF
//!  2: segment length (u32) - the whole frame including all headers
//!  6: flags (u16) - bits 0-3 priority, 0x1000 pooled, 0x4000 exchange
//!  8: packet number (u8) - per connection and direction, wraps around
//!  9: segment type (u8)
//! conversation header (4 bytes, all frames except heartbeat, heartbeat response and
//!  physical close)
//!  0: conversation id (u16)
//!  2: request number (u16)
//! segment start header (12 bytes, first frame of a segmented flow only)
//!  0: total length of the reassembled payload (u64)
//!  8: segment type of the reassembled transmission (u8)
//!  9: padding (3 bytes)
//! ```
//!
//! A transmission whose payload does not fit into a single frame of the max transmission size is
//!  sent as a *segmented flow*: a SEGMENTED_START frame, any number of SEGMENTED_MIDDLE frames
//!  and a SEGMENTED_END frame. Frames of other conversations may be interleaved with them.

pub mod framer;
pub mod headers;
pub mod parser;
pub mod priority;
pub mod segment_type;
