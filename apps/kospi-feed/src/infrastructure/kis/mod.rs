//! KIS Real-Time Feed Adapters
//!
//! Implements the broker side of the feed:
//!
//! - **auth**: OAuth issuance of access tokens and approval keys (HTTP)
//! - **credentials**: Tiered credential cache with file persistence
//! - **messages** / **codec**: Control frames and pipe-delimited tick frames
//! - **subscriber**: Paced batch subscription with ack tracking
//! - **connection**: Per-channel WebSocket state machine and reconnect loop
//! - **snapshot**: REST price inquiry used to seed quotes

pub mod auth;
pub mod codec;
pub mod connection;
pub mod credentials;
pub mod launcher;
pub mod messages;
pub mod reconnect;
pub mod snapshot;
pub mod subscriber;

pub use auth::HttpCredentialIssuer;
pub use codec::{
    CodecError, DataFrame, FieldOffsets, InboundFrame, KisCodec, OffsetTable, RawTick,
    ResponseType,
};
pub use connection::{ConnectionConfig, ConnectionDeps, ConnectionError, FeedConnection};
pub use credentials::{
    CredentialCache, CredentialError, CredentialStore, CredentialTtls, DEFAULT_CREDENTIAL_TTL,
    StoreError,
};
pub use launcher::KisFeedLauncher;
pub use messages::{AckOutcome, ControlMessage, SubscribeRequest};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use snapshot::{DEFAULT_REQUEST_DELAY, KisSnapshotLoader};
pub use subscriber::{AckRegistry, BatchSubscriber, SubscribePacing};
