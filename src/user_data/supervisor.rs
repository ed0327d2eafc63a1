use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    events::RawEvent,
    reader::{ReaderSettings, StreamReader, Termination},
    sources::ListenKeyProvider,
};
use crate::{config::UserDataConfig, types::ListenKey, ws_client::StreamConnector};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub reader: ReaderSettings,
    pub token_retry_delay: Duration,
    pub reconnect_delay: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &UserDataConfig) -> Self {
        Self {
            reader: ReaderSettings::from_config(config),
            token_retry_delay: config.token_retry_delay(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Keeps exactly one stream reader alive until shutdown.
///
/// Every attempt acquires a fresh listen key; a key is never reused across
/// connections. There is no retry cap.
pub struct ReconnectSupervisor {
    listen_keys: Arc<dyn ListenKeyProvider>,
    connector: Arc<dyn StreamConnector>,
    delivery: mpsc::UnboundedSender<RawEvent>,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(
        listen_keys: Arc<dyn ListenKeyProvider>,
        connector: Arc<dyn StreamConnector>,
        delivery: mpsc::UnboundedSender<RawEvent>,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listen_keys,
            connector,
            delivery,
            settings,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut connections: u64 = 0;
        while !self.shutdown.is_cancelled() {
            let Some(key) = self.acquire_key().await else {
                break;
            };

            connections += 1;
            let reader = StreamReader::new(
                self.connector.clone(),
                self.listen_keys.clone(),
                self.delivery.clone(),
                self.settings.reader,
                self.shutdown.clone(),
            );
            let termination = reader.run(key.clone()).await;
            self.release_key(&key).await;

            if matches!(termination, Termination::Shutdown) && self.delivery.is_closed() {
                break;
            }
            if !self.pause(self.settings.reconnect_delay).await {
                break;
            }
        }
        tracing::info!(connections, "user data supervisor stopped");
    }

    /// Retries until a key is issued. `None` means shutdown was requested.
    async fn acquire_key(&self) -> Option<ListenKey> {
        loop {
            let acquired = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                acquired = self.listen_keys.acquire() => acquired,
            };
            match acquired {
                Ok(key) => return Some(key),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_in_ms = self.settings.token_retry_delay.as_millis() as u64,
                        "listen key acquisition failed"
                    );
                    if !self.pause(self.settings.token_retry_delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn release_key(&self, key: &ListenKey) {
        if let Err(err) = self.listen_keys.release(key).await {
            tracing::debug!(error = %err, "listen key release failed");
        }
    }

    /// Sleeps for `delay`; returns `false` if shutdown fired first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
