//! Feed Launcher
//!
//! Builds and activates one [`FeedConnection`] per channel.

use std::sync::Arc;

use async_trait::async_trait;

use super::connection::{ConnectionConfig, ConnectionDeps, FeedConnection};
use crate::application::ports::{FeedHandle, FeedLauncher, LaunchError};
use crate::domain::instrument::InstrumentCode;
use crate::domain::streaming::ChannelSpec;

/// Launches KIS real-time connections.
pub struct KisFeedLauncher {
    config: ConnectionConfig,
    deps: ConnectionDeps,
}

impl KisFeedLauncher {
    /// Create a launcher sharing `deps` across connections.
    #[must_use]
    pub const fn new(config: ConnectionConfig, deps: ConnectionDeps) -> Self {
        Self { config, deps }
    }
}

#[async_trait]
impl FeedLauncher for KisFeedLauncher {
    async fn launch(
        &self,
        channel: ChannelSpec,
        instruments: Vec<InstrumentCode>,
    ) -> Result<Arc<dyn FeedHandle>, LaunchError> {
        let connection = Arc::new(FeedConnection::new(
            channel,
            instruments,
            self.config.clone(),
            self.deps.clone(),
        ));
        connection.activate().await?;
        Ok(connection)
    }
}
