//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (quote sink, snapshots, feeds).
pub mod ports;

/// Application services for session supervision and quote tracking.
pub mod services;
