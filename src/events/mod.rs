//! Observation streaming to the control plane
//!
//! Snapshots of worker state, aggregate statistics and recent log lines fan
//! out over a broadcast bus with rate limiting; a ring buffer keeps the log
//! tail for pull consumers.

mod bus;
mod errors;
mod ring;
mod types;

pub use bus::ObservationBus;
pub use errors::BusError;
pub use ring::LogRing;
pub use types::{InstanceSnapshot, LogLine, ObservationEvent, StatusSnapshot};
