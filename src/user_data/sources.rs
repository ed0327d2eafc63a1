use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    errors::RestResult,
    types::{AccountSnapshot, ListenKey},
    ws_client::StreamConnector,
};

/// Pulls the authoritative account state.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_account(&self) -> RestResult<AccountSnapshot>;
}

/// Issues, keeps alive and releases the session token of the user data stream.
#[async_trait]
pub trait ListenKeyProvider: Send + Sync + 'static {
    async fn acquire(&self) -> RestResult<ListenKey>;
    async fn renew(&self, key: &ListenKey) -> RestResult<()>;
    async fn release(&self, key: &ListenKey) -> RestResult<()>;
}

/// The three collaborators the local mirror is built from.
#[derive(Clone)]
pub struct UserDataSources {
    pub snapshots: Arc<dyn SnapshotSource>,
    pub listen_keys: Arc<dyn ListenKeyProvider>,
    pub connector: Arc<dyn StreamConnector>,
}

impl UserDataSources {
    pub fn new(
        snapshots: Arc<dyn SnapshotSource>,
        listen_keys: Arc<dyn ListenKeyProvider>,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        Self {
            snapshots,
            listen_keys,
            connector,
        }
    }
}
