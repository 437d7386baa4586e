//! OBD-II Polling Scheduler
//!
//! Cycles through registered PIDs, polling each on the cycles its priority
//! tier makes due. A sharp change in engine RPM promotes that PID to the
//! high tier for a fixed number of cycles.

mod entry;
mod scheduler;

pub use entry::{PollStats, PollingEntry, Tier};
pub use scheduler::{PidReader, PollSample, PollingOptions, PollingScheduler};
