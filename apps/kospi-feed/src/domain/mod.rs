//! Domain Layer - Market calendar, sessions, instruments and quotes.
//!
//! Pure types and rules with no I/O. Everything here is deterministic
//! given its inputs, which keeps it testable without a feed.

/// Exchange holiday and weekend calendar.
pub mod calendar;

/// Market session state machine.
pub mod session;

/// Futures and option contracts and their short codes.
pub mod instrument;

/// Active instrument universe derivation.
pub mod symbol_master;

/// Broker session credentials.
pub mod credential;

/// Normalized quote updates.
pub mod quote;

/// Feed channels and connection status types.
pub mod streaming;

/// Subscription tracking.
pub mod subscription;
