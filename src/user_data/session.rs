//! Listen key keep-alive.
//!
//! A failed renewal does not tear the connection down. It pulls the reader's deadline
//! in, so the next read times out and the supervisor reconnects with a fresh key.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::sources::ListenKeyProvider;
use crate::types::ListenKey;

/// Shared read deadline of one stream connection.
///
/// A failed renewal caps the deadline. While capped, refreshes after good frames never
/// move it past the cap; only a successful renewal lifts it.
#[derive(Clone)]
pub struct ReadDeadline {
    tx: Arc<watch::Sender<DeadlineState>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DeadlineState {
    pub(crate) expires_at: Instant,
    capped: Option<Instant>,
}

impl ReadDeadline {
    pub fn new(initial: Duration) -> Self {
        let (tx, _) = watch::channel(DeadlineState {
            expires_at: Instant::now() + initial,
            capped: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Pushes the deadline to now + `duration`, bounded by the cap if one is set.
    pub fn extend(&self, duration: Duration) {
        let target = Instant::now() + duration;
        self.tx.send_if_modified(|state| {
            let next = match state.capped {
                Some(cap) => target.min(cap),
                None => target,
            };
            if next == state.expires_at {
                return false;
            }
            state.expires_at = next;
            true
        });
    }

    /// Successful renewal: lifts any cap and pushes the deadline out.
    pub fn renewed(&self, duration: Duration) {
        self.tx.send_modify(|state| {
            state.capped = None;
            state.expires_at = Instant::now() + duration;
        });
    }

    /// Failed renewal: the deadline becomes now + `duration` and stays there.
    pub fn cap(&self, duration: Duration) {
        let cap = Instant::now() + duration;
        self.tx.send_modify(|state| {
            state.capped = Some(cap);
            state.expires_at = state.expires_at.min(cap);
        });
    }

    pub fn current(&self) -> Instant {
        self.tx.borrow().expires_at
    }

    pub fn is_capped(&self) -> bool {
        self.tx.borrow().capped.is_some()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeadlineState> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub interval: Duration,
    pub deadline: Duration,
    pub failure_deadline: Duration,
}

/// Renews `key` every `policy.interval` until `shutdown` fires.
pub async fn keep_alive(
    provider: Arc<dyn ListenKeyProvider>,
    key: ListenKey,
    deadline: ReadDeadline,
    policy: RenewalPolicy,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match provider.renew(&key).await {
            Ok(()) => {
                deadline.renewed(policy.deadline);
                tracing::debug!("listen key renewed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "listen key renewal failed, forcing reconnect");
                deadline.cap(policy.failure_deadline);
            }
        }
    }
}
