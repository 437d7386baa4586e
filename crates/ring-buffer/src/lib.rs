//! Bounded Ring Buffer
//!
//! A fixed-capacity buffer that evicts its oldest entry on overflow, and a
//! sequenced event log built on it. Readers always receive copies, so a
//! snapshot stays valid while writers keep appending.

mod buffer;
mod log;

pub use buffer::{RingBuffer, DEFAULT_CAPACITY};
pub use log::{EventLog, EventPage, LoggedEvent};
