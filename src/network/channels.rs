//! Site channels: per-destination handles over the RPC transport.
//!
//! The transport itself is external; the coordinator only needs a typed
//! handle per destination site. A missing handle is a configuration
//! error: callers log it and drop the operation, since the protocol has
//! no retry layer.

use crate::error::Result;
use crate::network::messages::{
    AsyncPullRequest, AsyncPullResponse, DataTransferRequest, DataTransferResponse,
    LivePullRequest, LivePullResponse, ReconfigurationControl, ReconfigurationRequest,
    ReconfigurationResponse,
};
use crate::types::SiteId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed handle to one remote site's reconfiguration coordinator.
///
/// Responses to multi-chunk operations (live and async pulls) are not
/// returned from the issuing call; the remote side routes them back as
/// `live_pull_response` / `async_pull_response` deliveries keyed by
/// pull id.
#[async_trait::async_trait]
pub trait SiteChannel: Send + Sync {
    /// Stop-and-copy prepare handshake.
    async fn reconfiguration(&self, req: ReconfigurationRequest) -> Result<ReconfigurationResponse>;

    /// Barrier signaling and pull acknowledgment.
    async fn reconfiguration_control(&self, req: ReconfigurationControl) -> Result<()>;

    /// Stop-and-copy bulk push of one chunk.
    async fn data_transfer(&self, req: DataTransferRequest) -> Result<DataTransferResponse>;

    /// Issue a demand pull at the source site.
    async fn live_pull(&self, req: LivePullRequest) -> Result<()>;

    /// Deliver one pull chunk back to the requesting site.
    async fn live_pull_response(&self, resp: LivePullResponse) -> Result<()>;

    /// Queue a pull at the source site for out-of-band scheduling.
    async fn async_pull(&self, req: AsyncPullRequest) -> Result<()>;

    /// Deliver one queued-pull chunk back to the requesting site.
    async fn async_pull_response(&self, resp: AsyncPullResponse) -> Result<()>;
}

/// Per-destination channel handles, shared read-mostly across all
/// protocol operations.
#[derive(Default)]
pub struct ChannelTable {
    channels: RwLock<HashMap<SiteId, Arc<dyn SiteChannel>>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handle for a site.
    pub fn register(&self, site: SiteId, channel: Arc<dyn SiteChannel>) {
        self.channels.write().insert(site, channel);
    }

    /// Look up the handle for a site. A miss is logged here; callers
    /// drop the operation.
    pub fn get(&self, site: SiteId) -> Option<Arc<dyn SiteChannel>> {
        let channel = self.channels.read().get(&site).cloned();
        if channel.is_none() {
            tracing::error!(site, "no channel registered for site, dropping operation");
        }
        channel
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTable")
            .field("sites", &self.channels.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct RefusingChannel;

    #[async_trait::async_trait]
    impl SiteChannel for RefusingChannel {
        async fn reconfiguration(
            &self,
            _req: ReconfigurationRequest,
        ) -> Result<ReconfigurationResponse> {
            Err(Error::Internal("down".to_string()))
        }
        async fn reconfiguration_control(&self, _req: ReconfigurationControl) -> Result<()> {
            Err(Error::Internal("down".to_string()))
        }
        async fn data_transfer(&self, _req: DataTransferRequest) -> Result<DataTransferResponse> {
            Err(Error::Internal("down".to_string()))
        }
        async fn live_pull(&self, _req: LivePullRequest) -> Result<()> {
            Err(Error::Internal("down".to_string()))
        }
        async fn live_pull_response(&self, _resp: LivePullResponse) -> Result<()> {
            Err(Error::Internal("down".to_string()))
        }
        async fn async_pull(&self, _req: AsyncPullRequest) -> Result<()> {
            Err(Error::Internal("down".to_string()))
        }
        async fn async_pull_response(&self, _resp: AsyncPullResponse) -> Result<()> {
            Err(Error::Internal("down".to_string()))
        }
    }

    #[test]
    fn test_channel_table_lookup() {
        let table = ChannelTable::new();
        assert!(table.is_empty());
        assert!(table.get(4).is_none());

        table.register(4, Arc::new(RefusingChannel));
        assert_eq!(table.len(), 1);
        assert!(table.get(4).is_some());
        assert!(table.get(5).is_none());
    }
}
