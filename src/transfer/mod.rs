//! Building blocks shared by downloads and uploads: byte ranges and their
//! generator, progress counters, rate limiting and resumable state.

pub mod instance;
pub mod range;
pub mod rate;
pub mod status;

pub use instance::{InstanceState, StateFile, Versioned};
pub use range::{Range, RangeGenMode, RangeList, RangeListGen};
pub use rate::RateLimiter;
pub use status::{ProgressSnapshot, SpeedStats, TransferStatus};
