use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    events::{RawEvent, UserDataEvent},
    mirror::AccountMirror,
    sources::SnapshotSource,
};
use crate::{errors::ErrorNotice, queue::OverwriteQueue, types::TradeFill};

/// Live snapshot refresh period in seconds, shared with the consumer handle.
#[derive(Debug, Clone)]
pub struct RefreshInterval(Arc<AtomicU64>);

impl RefreshInterval {
    pub fn new(period: Duration) -> Self {
        let interval = Self(Arc::new(AtomicU64::new(1)));
        interval.set_secs(period.as_secs());
        interval
    }

    /// Zero is clamped to one second.
    pub fn set_secs(&self, secs: u64) {
        self.0.store(secs.max(1), Ordering::Relaxed);
    }

    pub fn get(&self) -> Duration {
        Duration::from_secs(self.0.load(Ordering::Relaxed))
    }
}

/// Pulls full snapshots into the mirror.
#[derive(Clone)]
pub struct SnapshotRefresher {
    source: Arc<dyn SnapshotSource>,
    mirror: Arc<AccountMirror>,
    interval: RefreshInterval,
    shutdown: CancellationToken,
}

impl SnapshotRefresher {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        mirror: Arc<AccountMirror>,
        interval: RefreshInterval,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            mirror,
            interval,
            shutdown,
        }
    }

    /// One fetch. The mirror lock is only taken once the response is in hand.
    pub async fn refresh_once(&self) -> bool {
        match self.source.fetch_account().await {
            Ok(snapshot) => {
                self.mirror.replace_snapshot(snapshot).await;
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "account snapshot refresh failed");
                self.mirror.record_notice(ErrorNotice::SnapshotRefresh(err));
                false
            }
        }
    }

    /// Fetches until one attempt succeeds. Returns `false` on shutdown.
    pub async fn load_initial(&self, retry_delay: Duration) -> bool {
        loop {
            let loaded = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                loaded = self.refresh_once() => loaded,
            };
            if loaded {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    /// Periodic refresh. The period is re-read every cycle so changes apply from the
    /// next cycle on.
    pub async fn run(self) {
        loop {
            let period = self.interval.get();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.refresh_once() => {}
            }
        }
        tracing::debug!("snapshot refresher stopped");
    }
}

/// Applies stream records to the mirror and the trade queue, in delivery order.
///
/// Staleness is judged again when a record is applied: records can wait in the delivery
/// queue (for instance while the first snapshot is unavailable) and age past the
/// threshold after the reader let them through.
pub struct EventDispatcher {
    mirror: Arc<AccountMirror>,
    trades: Arc<OverwriteQueue<TradeFill>>,
    stale_after: Duration,
    shutdown: CancellationToken,
}

impl EventDispatcher {
    pub fn new(
        mirror: Arc<AccountMirror>,
        trades: Arc<OverwriteQueue<TradeFill>>,
        stale_after: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            mirror,
            trades,
            stale_after,
            shutdown,
        }
    }

    /// Returns `false` when `raw` was too old to apply.
    pub async fn dispatch(&self, raw: RawEvent) -> bool {
        if raw.is_stale(Utc::now(), self.stale_after) {
            tracing::debug!(
                kind = raw.kind().unwrap_or_default(),
                "dropping record that went stale before it was applied"
            );
            return false;
        }
        match UserDataEvent::classify(raw) {
            UserDataEvent::Account(update) => {
                for balance in &update.balances {
                    self.mirror.apply_balance(balance).await;
                }
                for position in &update.positions {
                    self.mirror.apply_position(position).await;
                }
            }
            UserDataEvent::Trade(fill) => {
                if let Some(evicted) = self.trades.push(fill) {
                    tracing::debug!(
                        order_id = evicted.order_id.into_inner(),
                        "trade queue full, oldest fill discarded"
                    );
                }
            }
            // order lifecycle handling is not wired up yet
            UserDataEvent::OrderLifecycle { .. } => {}
            UserDataEvent::ListenKeyExpired | UserDataEvent::Ignored { .. } => {}
        }
        true
    }

    fn prune_stale(&self, backlog: &mut VecDeque<RawEvent>) {
        let now = Utc::now();
        while backlog
            .front()
            .is_some_and(|raw| raw.is_stale(now, self.stale_after))
        {
            backlog.pop_front();
        }
    }

    /// Loads the first snapshot, then drains `delivery` until shutdown or until every
    /// sender is gone.
    pub async fn run(
        self,
        refresher: SnapshotRefresher,
        retry_delay: Duration,
        mut delivery: mpsc::UnboundedReceiver<RawEvent>,
    ) {
        // Records that arrive before the first snapshot wait in a backlog that sheds
        // whatever goes stale, so a long REST outage does not pile them up.
        let mut backlog = VecDeque::new();
        let mut delivery_open = true;
        {
            let initial = refresher.load_initial(retry_delay);
            tokio::pin!(initial);
            loop {
                tokio::select! {
                    loaded = &mut initial => {
                        if !loaded {
                            return;
                        }
                        break;
                    }
                    raw = delivery.recv(), if delivery_open => match raw {
                        Some(raw) => {
                            backlog.push_back(raw);
                            self.prune_stale(&mut backlog);
                        }
                        None => delivery_open = false,
                    },
                }
            }
        }
        for raw in backlog {
            self.dispatch(raw).await;
        }
        if !delivery_open {
            tracing::debug!("event dispatcher stopped");
            return;
        }
        loop {
            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                raw = delivery.recv() => raw,
            };
            match raw {
                Some(raw) => {
                    self.dispatch(raw).await;
                }
                None => break,
            }
        }
        tracing::debug!("event dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{RestError, RestResult},
        types::{AccountSnapshot, BalanceRecord, OrderId, PositionRecord},
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use std::{str::FromStr, sync::Mutex};

    fn dec(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    fn raw(value: Value) -> RawEvent {
        RawEvent::decode(&value.to_string()).unwrap()
    }

    fn account(wallet: &str) -> AccountSnapshot {
        AccountSnapshot {
            assets: vec![BalanceRecord {
                asset: "USDT".into(),
                wallet_balance: dec(wallet),
                cross_wallet_balance: dec("80"),
                ..BalanceRecord::default()
            }],
            positions: vec![PositionRecord {
                symbol: "BTCUSDT".into(),
                position_side: "BOTH".into(),
                ..PositionRecord::default()
            }],
            ..AccountSnapshot::default()
        }
    }

    /// Serves the scripted results in order, then repeats the last one.
    struct ScriptedSnapshots {
        results: Mutex<Vec<RestResult<AccountSnapshot>>>,
        calls: AtomicU64,
    }

    impl ScriptedSnapshots {
        fn new(mut results: Vec<RestResult<AccountSnapshot>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSnapshots {
        async fn fetch_account(&self) -> RestResult<AccountSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                return results.pop().unwrap();
            }
            match results.last() {
                Some(Ok(snapshot)) => Ok(snapshot.clone()),
                _ => Err(RestError::Http {
                    status: 500,
                    body: "down".into(),
                }),
            }
        }
    }

    fn harness() -> (Arc<AccountMirror>, Arc<OverwriteQueue<TradeFill>>, EventDispatcher) {
        let mirror = Arc::new(AccountMirror::new(Arc::new(OverwriteQueue::new(5))));
        let trades = Arc::new(OverwriteQueue::new(100));
        let dispatcher = EventDispatcher::new(
            mirror.clone(),
            trades.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        (mirror, trades, dispatcher)
    }

    #[test]
    fn test_refresh_interval_clamps_zero() {
        let interval = RefreshInterval::new(Duration::from_secs(60));
        assert_eq!(interval.get(), Duration::from_secs(60));
        interval.set_secs(0);
        assert_eq!(interval.get(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_account_update_merges_into_mirror() {
        let (mirror, _trades, dispatcher) = harness();
        mirror.replace_snapshot(account("100")).await;
        dispatcher
            .dispatch(raw(json!({
                "e": "ACCOUNT_UPDATE",
                "E": Utc::now().timestamp_millis(),
                "a": {
                    "m": "ORDER",
                    "B": [{"a": "USDT", "wb": "90", "cw": "80"}, {"a": "BNB", "wb": "1", "cw": "1"}],
                    "P": [{"s": "BTCUSDT", "pa": "0.25", "ep": "20000", "up": "1.5",
                           "mt": "isolated", "ps": "BOTH"}]
                }
            })))
            .await;

        let snapshot = mirror.read().await.0.unwrap();
        assert_eq!(snapshot.balance("USDT").unwrap().wallet_balance, dec("90"));
        assert_eq!(snapshot.balance("USDT").unwrap().cross_wallet_balance, dec("80"));
        assert!(snapshot.balance("BNB").is_none());
        let btc = snapshot.position("BTCUSDT").unwrap();
        assert_eq!(btc.position_amount, dec("0.25"));
        assert!(btc.isolated);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_records_older_than_threshold() {
        let (mirror, trades, dispatcher) = harness();
        mirror.replace_snapshot(account("100")).await;
        let two_hours_ago = (Utc::now() - chrono::Duration::hours(2)).timestamp_millis();
        let applied = dispatcher
            .dispatch(raw(json!({
                "e": "ACCOUNT_UPDATE",
                "E": two_hours_ago,
                "a": {"B": [{"a": "USDT", "wb": "1", "cw": "1"}]}
            })))
            .await;
        assert!(!applied);
        let snapshot = mirror.read().await.0.unwrap();
        assert_eq!(snapshot.balance("USDT").unwrap().wallet_balance, dec("100"));
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_ages_out_while_first_snapshot_fails() {
        let mirror = Arc::new(AccountMirror::new(Arc::new(OverwriteQueue::new(5))));
        let dispatcher = EventDispatcher::new(
            mirror.clone(),
            Arc::new(OverwriteQueue::new(100)),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let source = Arc::new(ScriptedSnapshots::new(vec![
            Err(RestError::Http {
                status: 503,
                body: "down".into(),
            }),
            Ok(account("100")),
        ]));
        let refresher = SnapshotRefresher::new(
            source,
            mirror.clone(),
            RefreshInterval::new(Duration::from_secs(60)),
            CancellationToken::new(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(raw(json!({
            "e": "ACCOUNT_UPDATE",
            "E": Utc::now().timestamp_millis(),
            "a": {"B": [{"a": "USDT", "wb": "1", "cw": "1"}]}
        })))
        .unwrap();
        drop(tx);

        // the record is fresh when queued and over a second old once the retry loads
        dispatcher
            .run(refresher, Duration::from_millis(1500), rx)
            .await;
        let snapshot = mirror.read().await.0.unwrap();
        assert_eq!(snapshot.balance("USDT").unwrap().wallet_balance, dec("100"));
    }

    #[tokio::test]
    async fn test_trade_fills_reach_queue_in_order() {
        let (_mirror, trades, dispatcher) = harness();
        for (order_id, execution) in [(1, "TRADE"), (2, "NEW"), (3, "TRADE")] {
            dispatcher
                .dispatch(raw(json!({
                    "e": "ORDER_TRADE_UPDATE",
                    "E": Utc::now().timestamp_millis(),
                    "o": {"s": "BTCUSDT", "S": "BUY", "x": execution, "i": order_id,
                          "m": false, "L": "20000", "l": "1", "n": "0.01"}
                })))
                .await;
        }
        let ids: Vec<_> = trades.drain().into_iter().map(|fill| fill.order_id).collect();
        assert_eq!(ids, vec![OrderId::new(1), OrderId::new(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_retries_and_records_notices() {
        let source = Arc::new(ScriptedSnapshots::new(vec![
            Err(RestError::Http {
                status: 502,
                body: "bad gateway".into(),
            }),
            Ok(account("100")),
        ]));
        let mirror = Arc::new(AccountMirror::new(Arc::new(OverwriteQueue::new(5))));
        let refresher = SnapshotRefresher::new(
            source.clone(),
            mirror.clone(),
            RefreshInterval::new(Duration::from_secs(60)),
            CancellationToken::new(),
        );
        assert!(refresher.load_initial(Duration::from_secs(5)).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let (snapshot, errors) = mirror.read().await;
        assert_eq!(snapshot, Some(account("100")));
        assert!(errors.unwrap().to_string().contains("bad gateway"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_last_snapshot() {
        let source = Arc::new(ScriptedSnapshots::new(vec![
            Ok(account("100")),
            Err(RestError::Http {
                status: 500,
                body: "down".into(),
            }),
        ]));
        let mirror = Arc::new(AccountMirror::new(Arc::new(OverwriteQueue::new(5))));
        let shutdown = CancellationToken::new();
        let interval = RefreshInterval::new(Duration::from_secs(60));
        let refresher =
            SnapshotRefresher::new(source.clone(), mirror.clone(), interval.clone(), shutdown.clone());
        assert!(refresher.refresh_once().await);
        interval.set_secs(10);
        let task = tokio::spawn(refresher.run());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        let (snapshot, errors) = mirror.read().await;
        assert_eq!(snapshot, Some(account("100")));
        assert_eq!(errors.unwrap().len(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_delivery_closes() {
        let (mirror, _trades, dispatcher) = harness();
        let source = Arc::new(ScriptedSnapshots::new(vec![Ok(account("100"))]));
        let refresher = SnapshotRefresher::new(
            source,
            mirror.clone(),
            RefreshInterval::new(Duration::from_secs(60)),
            CancellationToken::new(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(raw(json!({
            "e": "ACCOUNT_UPDATE",
            "E": Utc::now().timestamp_millis(),
            "a": {"B": [{"a": "USDT", "wb": "90", "cw": "80"}]}
        })))
        .unwrap();
        drop(tx);

        dispatcher.run(refresher, Duration::from_secs(5), rx).await;
        let snapshot = mirror.read().await.0.unwrap();
        assert_eq!(snapshot.balance("USDT").unwrap().wallet_balance, dec("90"));
    }
}
