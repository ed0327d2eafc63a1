use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    dispatcher::{EventDispatcher, RefreshInterval, SnapshotRefresher},
    mirror::AccountMirror,
    sources::UserDataSources,
    supervisor::{ReconnectSupervisor, SupervisorSettings},
};
use crate::{
    config::UserDataConfig,
    errors::{ErrorNotice, PendingErrors, QueueClosed},
    queue::OverwriteQueue,
    types::{AccountSnapshot, TradeFill},
};

/// Consumer handle of a locally mirrored account.
///
/// Background work (stream supervision, event dispatch and snapshot refresh) runs on
/// the tokio runtime until [`close`](Self::close), [`shutdown`](Self::shutdown) or drop.
pub struct LocalUserData {
    mirror: Arc<AccountMirror>,
    trades: Arc<OverwriteQueue<TradeFill>>,
    errors: Arc<OverwriteQueue<ErrorNotice>>,
    refresh: RefreshInterval,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalUserData {
    /// Starts synchronisation and waits `startup_grace` so the first connection has a
    /// chance to come up before the handle is returned.
    pub async fn start(sources: UserDataSources, config: UserDataConfig) -> Result<Self> {
        config.validate()?;

        let errors = Arc::new(OverwriteQueue::new(config.error_capacity));
        let trades = Arc::new(OverwriteQueue::new(config.trade_capacity));
        let mirror = Arc::new(AccountMirror::new(errors.clone()));
        let refresh = RefreshInterval::new(config.snapshot_refresh());
        let shutdown = CancellationToken::new();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("local_user_data");
        let refresher = SnapshotRefresher::new(
            sources.snapshots.clone(),
            mirror.clone(),
            refresh.clone(),
            shutdown.clone(),
        );
        let supervisor = ReconnectSupervisor::new(
            sources.listen_keys.clone(),
            sources.connector.clone(),
            delivery_tx,
            SupervisorSettings::from_config(&config),
            shutdown.clone(),
        );
        let dispatcher = EventDispatcher::new(
            mirror.clone(),
            trades.clone(),
            config.stale_after(),
            shutdown.clone(),
        );

        let tasks = vec![
            tokio::spawn(supervisor.run().instrument(span.clone())),
            tokio::spawn(
                dispatcher
                    .run(refresher.clone(), config.token_retry_delay(), delivery_rx)
                    .instrument(span.clone()),
            ),
            tokio::spawn(refresher.run().instrument(span.clone())),
        ];
        span.in_scope(|| {
            tracing::info!(
                refresh_secs = config.snapshot_refresh_secs,
                "local user data started"
            )
        });

        tokio::time::sleep(config.startup_grace()).await;
        Ok(Self {
            mirror,
            trades,
            errors,
            refresh,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Copy of the mirrored account plus every snapshot error recorded since the last
    /// call. The snapshot is `None` until the first successful fetch.
    pub async fn read(&self) -> (Option<AccountSnapshot>, Option<PendingErrors>) {
        self.mirror.read().await
    }

    /// Waits for the next trade fill. Fails once the handle is closed and the queue is
    /// drained.
    pub async fn next_trade(&self) -> Result<TradeFill, QueueClosed> {
        self.trades.pop().await
    }

    pub fn try_next_trade(&self) -> Result<Option<TradeFill>, QueueClosed> {
        self.trades.try_pop()
    }

    /// Applies from the next refresh cycle. Zero is treated as one second.
    pub fn set_snapshot_refresh_interval(&self, secs: u64) {
        self.refresh.set_secs(secs);
    }

    pub fn snapshot_refresh_interval(&self) -> std::time::Duration {
        self.refresh.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signals every background task to stop and closes both queues. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.trades.close();
        self.errors.close();
        tracing::info!("local user data closed");
    }

    /// Closes the handle and waits for every background task to finish.
    pub async fn shutdown(self) {
        self.close();
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "user data task ended abnormally");
            }
        }
    }
}

impl Drop for LocalUserData {
    fn drop(&mut self) {
        self.close();
    }
}
