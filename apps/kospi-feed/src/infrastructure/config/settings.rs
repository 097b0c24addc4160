//! Feed Configuration Settings
//!
//! Configuration types for the feed service, loaded from environment
//! variables. Parsing goes through a lookup function so tests never touch
//! the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::application::services::{SupervisorConfig, TransitionSchedule};
use crate::domain::quote::GreeksZeroPolicy;
use crate::domain::streaming::ChannelPlan;
use crate::domain::symbol_master::{StrikeRangePolicy, SymbolMasterConfig};
use crate::infrastructure::kis::{
    ConnectionConfig, CredentialTtls, DEFAULT_CREDENTIAL_TTL, ReconnectConfig, SubscribePacing,
};

/// Broker application key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AppCredentials {
    app_key: String,
    app_secret: String,
}

impl AppCredentials {
    /// Create credentials.
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        }
    }

    /// Application key.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Application secret.
    #[must_use]
    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Broker endpoints.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// REST base URL (credential issuance).
    pub rest_url: String,
    /// Real-time WebSocket URL.
    pub ws_url: String,
    /// Customer type (`P` personal, `B` corporate).
    pub custtype: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://openapi.koreainvestment.com:9443".to_string(),
            ws_url: "ws://ops.koreainvestment.com:21000".to_string(),
            custtype: "P".to_string(),
        }
    }
}

/// Credential cache settings.
#[derive(Debug, Clone)]
pub struct CredentialSettings {
    /// Directory for the credential files.
    pub dir: PathBuf,
    /// Lifetime of an approval key.
    pub approval_key_ttl: Duration,
    /// HTTP timeout for issuance requests.
    pub request_timeout: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            approval_key_ttl: DEFAULT_CREDENTIAL_TTL,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Subscription pacing and cap.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Instruments per batch.
    pub batch_size: usize,
    /// Wait for each ack.
    pub ack_timeout: Duration,
    /// Pause between instruments.
    pub symbol_delay: Duration,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Pause before the first subscribe frame.
    pub settle_delay: Duration,
    /// Upstream per-connection cap (0 = unlimited).
    pub max_subscriptions: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        let pacing = SubscribePacing::default();
        Self {
            batch_size: pacing.batch_size,
            ack_timeout: pacing.ack_timeout,
            symbol_delay: pacing.symbol_delay,
            batch_delay: pacing.batch_delay,
            settle_delay: pacing.settle_delay,
            max_subscriptions: 40,
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Limit on opening the transport.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnects.
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 0,
        }
    }
}

/// Session transition scheduling.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    /// Exchange-local times at which transitions are evaluated.
    pub trigger_times: Vec<NaiveTime>,
    /// How far ahead a transition looks when choosing the target session.
    pub activation_lead: Duration,
    /// Pause between channel launches.
    pub activation_stagger: Duration,
    /// Whether startup seeds quotes from the REST snapshot.
    pub seed_snapshot: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            trigger_times: default_trigger_times(),
            activation_lead: Duration::from_secs(900),
            activation_stagger: Duration::from_millis(2000),
            seed_snapshot: true,
        }
    }
}

/// Option universe sizing.
#[derive(Debug, Clone)]
pub struct UniverseSettings {
    /// Strike half-width at the reference volatility.
    pub strike_range: Decimal,
    /// Listed strike spacing.
    pub strike_grid: Decimal,
    /// Smallest half-width.
    pub strike_range_min: Decimal,
    /// Largest half-width.
    pub strike_range_max: Decimal,
    /// Volatility at which `strike_range` applies.
    pub reference_iv: Decimal,
    /// Underlying estimate before any price arrives.
    pub default_underlying: Decimal,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            strike_range: dec!(15),
            strike_grid: dec!(2.5),
            strike_range_min: dec!(7.5),
            strike_range_max: dec!(30),
            reference_iv: dec!(15),
            default_underlying: dec!(585.0),
        }
    }
}

/// Calendar and session rules.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Interpretation of zero greeks.
    pub greeks_zero_policy: GreeksZeroPolicy,
    /// Whether a night session carries into a holiday morning.
    pub night_into_holiday: bool,
    /// Holidays added to the built-in calendar.
    pub extra_holidays: Vec<NaiveDate>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            greeks_zero_policy: GreeksZeroPolicy::Preserve,
            night_into_holiday: true,
            extra_holidays: Vec::new(),
        }
    }
}

/// Server and fan-out settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Capacity of the quote broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8082,
            broadcast_capacity: 50_000,
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Broker application key pair.
    pub credentials: AppCredentials,
    /// Broker endpoints.
    pub broker: BrokerSettings,
    /// Credential cache.
    pub credential_cache: CredentialSettings,
    /// Subscription pacing.
    pub subscription: SubscriptionSettings,
    /// WebSocket settings.
    pub websocket: WebSocketSettings,
    /// Transition scheduling.
    pub schedule: ScheduleSettings,
    /// Universe sizing.
    pub universe: UniverseSettings,
    /// Session rules.
    pub session: SessionSettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or a structured
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Numeric values that fail to parse fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `KIS_APP_KEY`/`KIS_APP_SECRET` are missing or
    /// empty, or if trigger times or extra holidays are malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_key = required(&lookup, "KIS_APP_KEY")?;
        let app_secret = required(&lookup, "KIS_APP_SECRET")?;

        let broker_defaults = BrokerSettings::default();
        let broker = BrokerSettings {
            rest_url: lookup("KIS_REST_URL").unwrap_or(broker_defaults.rest_url),
            ws_url: lookup("KIS_WS_URL").unwrap_or(broker_defaults.ws_url),
            custtype: lookup("KIS_CUSTTYPE").unwrap_or(broker_defaults.custtype),
        };

        let cache_defaults = CredentialSettings::default();
        let credential_cache = CredentialSettings {
            dir: lookup("FEED_CREDENTIAL_DIR").map_or(cache_defaults.dir, PathBuf::from),
            approval_key_ttl: parse_duration_secs(
                &lookup,
                "FEED_APPROVAL_KEY_TTL_SECS",
                cache_defaults.approval_key_ttl,
            ),
            request_timeout: cache_defaults.request_timeout,
        };

        let sub_defaults = SubscriptionSettings::default();
        let subscription = SubscriptionSettings {
            batch_size: parse_or(&lookup, "FEED_SUBSCRIBE_BATCH_SIZE", sub_defaults.batch_size),
            ack_timeout: parse_duration_millis(
                &lookup,
                "FEED_SUBSCRIBE_ACK_TIMEOUT_MS",
                sub_defaults.ack_timeout,
            ),
            symbol_delay: parse_duration_millis(
                &lookup,
                "FEED_SUBSCRIBE_SYMBOL_DELAY_MS",
                sub_defaults.symbol_delay,
            ),
            batch_delay: parse_duration_millis(
                &lookup,
                "FEED_SUBSCRIBE_BATCH_DELAY_MS",
                sub_defaults.batch_delay,
            ),
            settle_delay: parse_duration_millis(
                &lookup,
                "FEED_SUBSCRIBE_SETTLE_MS",
                sub_defaults.settle_delay,
            ),
            max_subscriptions: parse_or(
                &lookup,
                "FEED_MAX_SUBSCRIPTIONS",
                sub_defaults.max_subscriptions,
            ),
        };

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            connect_timeout: parse_duration_secs(
                &lookup,
                "FEED_CONNECT_TIMEOUT_SECS",
                ws_defaults.connect_timeout,
            ),
            reconnect_delay: parse_duration_millis(
                &lookup,
                "FEED_RECONNECT_DELAY_MS",
                ws_defaults.reconnect_delay,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "FEED_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            ),
        };

        let schedule_defaults = ScheduleSettings::default();
        let schedule = ScheduleSettings {
            trigger_times: match lookup("FEED_TRIGGER_TIMES") {
                Some(raw) => parse_trigger_times(&raw)?,
                None => schedule_defaults.trigger_times,
            },
            activation_lead: parse_duration_secs(
                &lookup,
                "FEED_ACTIVATION_LEAD_SECS",
                schedule_defaults.activation_lead,
            ),
            activation_stagger: parse_duration_millis(
                &lookup,
                "FEED_ACTIVATION_STAGGER_MS",
                schedule_defaults.activation_stagger,
            ),
            seed_snapshot: parse_or(&lookup, "FEED_SEED_SNAPSHOT", schedule_defaults.seed_snapshot),
        };

        let universe_defaults = UniverseSettings::default();
        let universe = UniverseSettings {
            strike_range: parse_or(&lookup, "FEED_STRIKE_RANGE", universe_defaults.strike_range),
            strike_grid: parse_or(&lookup, "FEED_STRIKE_GRID", universe_defaults.strike_grid),
            strike_range_min: parse_or(
                &lookup,
                "FEED_STRIKE_RANGE_MIN",
                universe_defaults.strike_range_min,
            ),
            strike_range_max: parse_or(
                &lookup,
                "FEED_STRIKE_RANGE_MAX",
                universe_defaults.strike_range_max,
            ),
            reference_iv: parse_or(&lookup, "FEED_REFERENCE_IV", universe_defaults.reference_iv),
            default_underlying: parse_or(
                &lookup,
                "FEED_DEFAULT_UNDERLYING",
                universe_defaults.default_underlying,
            ),
        };

        let session_defaults = SessionSettings::default();
        let session = SessionSettings {
            greeks_zero_policy: lookup("FEED_GREEKS_ZERO_POLICY")
                .map_or(session_defaults.greeks_zero_policy, |s| {
                    GreeksZeroPolicy::from_str_case_insensitive(&s)
                }),
            night_into_holiday: parse_or(
                &lookup,
                "FEED_NIGHT_INTO_HOLIDAY",
                session_defaults.night_into_holiday,
            ),
            extra_holidays: match lookup("FEED_EXTRA_HOLIDAYS") {
                Some(raw) => parse_holidays(&raw)?,
                None => session_defaults.extra_holidays,
            },
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: parse_or(&lookup, "FEED_HEALTH_PORT", server_defaults.health_port),
            broadcast_capacity: parse_or(
                &lookup,
                "FEED_BROADCAST_CAPACITY",
                server_defaults.broadcast_capacity,
            ),
        };

        Ok(Self {
            credentials: AppCredentials::new(app_key, app_secret),
            broker,
            credential_cache,
            subscription,
            websocket,
            schedule,
            universe,
            session,
            server,
        })
    }

    /// Connection settings for the feed launcher.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            ws_url: self.broker.ws_url.clone(),
            custtype: self.broker.custtype.clone(),
            connect_timeout: self.websocket.connect_timeout,
            pacing: SubscribePacing {
                batch_size: self.subscription.batch_size,
                ack_timeout: self.subscription.ack_timeout,
                symbol_delay: self.subscription.symbol_delay,
                batch_delay: self.subscription.batch_delay,
                settle_delay: self.subscription.settle_delay,
            },
            reconnect: ReconnectConfig::fixed(
                self.websocket.reconnect_delay,
                self.websocket.max_reconnect_attempts,
            ),
            max_subscriptions: self.subscription.max_subscriptions,
            greeks_policy: self.session.greeks_zero_policy,
        }
    }

    /// Universe derivation settings.
    #[must_use]
    pub fn symbol_master_config(&self) -> SymbolMasterConfig {
        SymbolMasterConfig {
            strike_grid: self.universe.strike_grid,
            strike_range: StrikeRangePolicy {
                base: self.universe.strike_range,
                reference_iv: self.universe.reference_iv,
                min: self.universe.strike_range_min,
                max: self.universe.strike_range_max,
            },
            default_underlying: self.universe.default_underlying,
            max_codes: self.subscription.max_subscriptions,
            ..SymbolMasterConfig::default()
        }
    }

    /// Supervisor settings.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            plan: ChannelPlan::default(),
            activation_lead: self.schedule.activation_lead,
            activation_stagger: self.schedule.activation_stagger,
        }
    }

    /// Daily transition triggers.
    #[must_use]
    pub fn transition_schedule(&self) -> TransitionSchedule {
        TransitionSchedule::new(self.schedule.trigger_times.iter().copied())
    }

    /// Credential lifetimes.
    #[must_use]
    pub fn credential_ttls(&self) -> CredentialTtls {
        CredentialTtls {
            approval_key: self.credential_cache.approval_key_ttl,
            ..CredentialTtls::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Structured value could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn default_trigger_times() -> Vec<NaiveTime> {
    [(8, 40), (17, 55)]
        .into_iter()
        .filter_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0))
        .collect()
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn parse_trigger_times(raw: &str) -> Result<Vec<NaiveTime>, ConfigError> {
    let mut times = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| ConfigError::InvalidValue {
                key: "FEED_TRIGGER_TIMES".to_string(),
                value: s.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    times.sort_unstable();
    times.dedup();
    Ok(times)
}

fn parse_holidays(raw: &str) -> Result<Vec<NaiveDate>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ConfigError::InvalidValue {
                key: "FEED_EXTRA_HOLIDAYS".to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}
