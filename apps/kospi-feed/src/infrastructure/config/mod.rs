//! Configuration Module
//!
//! Configuration loading for the feed service.

mod settings;

pub use settings::{
    AppCredentials, BrokerSettings, ConfigError, CredentialSettings, FeedConfig, ScheduleSettings,
    ServerSettings, SessionSettings, SubscriptionSettings, UniverseSettings, WebSocketSettings,
};
