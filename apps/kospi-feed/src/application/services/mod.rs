//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `FeedSupervisor`: Opens and closes feed channels as sessions change
//! - `TransitionSchedule`: Daily trigger times for session transitions
//! - `TrackingSink`: Feeds observed prices back into the symbol master

mod schedule;
mod supervisor;
mod tracking;

pub use schedule::{DEFAULT_TRIGGER_TIMES, TransitionSchedule};
pub use supervisor::{
    DEFAULT_ACTIVATION_LEAD, DEFAULT_ACTIVATION_STAGGER, FeedSupervisor, SeedReport,
    SupervisorConfig, TransitionReport,
};
pub use tracking::TrackingSink;
