use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    events::{RawEvent, LISTEN_KEY_EXPIRED},
    session::{self, ReadDeadline, RenewalPolicy},
    sources::ListenKeyProvider,
};
use crate::{
    config::UserDataConfig,
    errors::StreamError,
    types::ListenKey,
    ws_client::{MessageStream, StreamConnector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Connecting,
    Streaming,
    Terminated,
}

/// Why a reader stopped.
#[derive(Debug)]
pub enum Termination {
    Shutdown,
    Failed(StreamError),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Shutdown => f.write_str("shutdown"),
            Termination::Failed(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub renewal: RenewalPolicy,
    pub stale_after: Duration,
}

impl ReaderSettings {
    pub fn from_config(config: &UserDataConfig) -> Self {
        Self {
            renewal: RenewalPolicy {
                interval: config.listen_key_renew(),
                deadline: config.read_deadline(),
                failure_deadline: config.renew_failure_deadline(),
            },
            stale_after: config.stale_after(),
        }
    }
}

/// Owns a single stream connection from dial to termination.
///
/// `run` consumes the reader, so a terminated reader can never be resumed; the
/// supervisor builds a new one for every attempt.
pub struct StreamReader {
    connector: Arc<dyn StreamConnector>,
    listen_keys: Arc<dyn ListenKeyProvider>,
    delivery: mpsc::UnboundedSender<RawEvent>,
    settings: ReaderSettings,
    shutdown: CancellationToken,
    state: ReaderState,
    forwarded: u64,
    dropped_stale: u64,
}

impl StreamReader {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        listen_keys: Arc<dyn ListenKeyProvider>,
        delivery: mpsc::UnboundedSender<RawEvent>,
        settings: ReaderSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            listen_keys,
            delivery,
            settings,
            shutdown,
            state: ReaderState::Connecting,
            forwarded: 0,
            dropped_stale: 0,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub async fn run(mut self, key: ListenKey) -> Termination {
        let dialed = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            dialed = self.connector.connect(&key) => Some(dialed),
        };
        let mut connection = match dialed {
            None => return self.terminate(Termination::Shutdown),
            Some(Ok(connection)) => connection,
            Some(Err(err)) => {
                let err = match err {
                    StreamError::Dial(_) => err,
                    other => StreamError::Dial(other.to_string()),
                };
                return self.terminate(Termination::Failed(err));
            }
        };

        let deadline = ReadDeadline::new(self.settings.renewal.deadline);
        // Cancelled when this reader returns, which also stops the renewal task.
        let connection_scope = self.shutdown.child_token();
        let renewal = tokio::spawn(session::keep_alive(
            self.listen_keys.clone(),
            key,
            deadline.clone(),
            self.settings.renewal,
            connection_scope.clone(),
        ));

        self.state = ReaderState::Streaming;
        let termination = self.stream(&mut *connection, &deadline).await;

        connection_scope.cancel();
        connection.close().await;
        if let Err(err) = renewal.await {
            tracing::debug!(error = %err, "renewal task ended abnormally");
        }
        self.terminate(termination)
    }

    async fn stream(
        &mut self,
        connection: &mut dyn MessageStream,
        deadline: &ReadDeadline,
    ) -> Termination {
        let mut deadline_rx = deadline.subscribe();
        loop {
            let expires_at = deadline_rx.borrow_and_update().expires_at;
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Termination::Shutdown,
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return Termination::Failed(StreamError::DeadlineExpired);
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(expires_at) => {
                    return Termination::Failed(StreamError::DeadlineExpired);
                }
                frame = connection.read_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => return Termination::Failed(err),
            };
            let record = match RawEvent::decode(&frame) {
                Ok(record) => record,
                Err(err) => return Termination::Failed(err),
            };
            deadline.extend(self.settings.renewal.deadline);

            if record.kind() == Some(LISTEN_KEY_EXPIRED) {
                return Termination::Failed(StreamError::SessionExpired);
            }
            if record.is_stale(Utc::now(), self.settings.stale_after) {
                self.dropped_stale += 1;
                tracing::debug!(kind = record.kind().unwrap_or_default(), "dropping stale record");
                continue;
            }
            if self.delivery.send(record).is_err() {
                return Termination::Shutdown;
            }
            self.forwarded += 1;
        }
    }

    fn terminate(&mut self, termination: Termination) -> Termination {
        self.state = ReaderState::Terminated;
        match &termination {
            Termination::Shutdown => tracing::info!(
                forwarded = self.forwarded,
                dropped_stale = self.dropped_stale,
                "user data reader stopped"
            ),
            Termination::Failed(err) => tracing::info!(
                error = %err,
                forwarded = self.forwarded,
                dropped_stale = self.dropped_stale,
                "user data reader terminated, reconnecting"
            ),
        }
        termination
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::{RestError, RestResult, StreamResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Frames to serve, then either an error or a connection that stays silent.
    pub(crate) struct ScriptedStream {
        frames: VecDeque<StreamResult<String>>,
    }

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn read_frame(&mut self) -> StreamResult<String> {
            match self.frames.pop_front() {
                Some(frame) => frame,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    /// Emits a fresh account update every `every`, forever.
    struct BusyStream {
        every: Duration,
    }

    #[async_trait]
    impl MessageStream for BusyStream {
        async fn read_frame(&mut self) -> StreamResult<String> {
            tokio::time::sleep(self.every).await;
            Ok(json!({"e": "ACCOUNT_UPDATE", "E": Utc::now().timestamp_millis()}).to_string())
        }

        async fn close(&mut self) {}
    }

    struct BusyConnector;

    #[async_trait]
    impl StreamConnector for BusyConnector {
        async fn connect(&self, _key: &ListenKey) -> StreamResult<Box<dyn MessageStream>> {
            Ok(Box::new(BusyStream {
                every: Duration::from_millis(500),
            }))
        }
    }

    pub(crate) struct ScriptedConnector {
        scripts: Mutex<VecDeque<StreamResult<Vec<StreamResult<String>>>>>,
        pub(crate) dials: AtomicUsize,
    }

    impl ScriptedConnector {
        pub(crate) fn new(scripts: Vec<StreamResult<Vec<StreamResult<String>>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                dials: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self, _key: &ListenKey) -> StreamResult<Box<dyn MessageStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(Ok(frames)) => Ok(Box::new(ScriptedStream {
                    frames: frames.into(),
                })),
                Some(Err(err)) => Err(err),
                None => Ok(Box::new(ScriptedStream {
                    frames: VecDeque::new(),
                })),
            }
        }
    }

    pub(crate) struct StaticKeys {
        pub(crate) fail_renewals: bool,
    }

    #[async_trait]
    impl ListenKeyProvider for StaticKeys {
        async fn acquire(&self) -> RestResult<ListenKey> {
            Ok(ListenKey::new("key"))
        }

        async fn renew(&self, _key: &ListenKey) -> RestResult<()> {
            if self.fail_renewals {
                Err(RestError::Http {
                    status: 400,
                    body: "unknown listen key".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn release(&self, _key: &ListenKey) -> RestResult<()> {
            Ok(())
        }
    }

    pub(crate) const SETTINGS: ReaderSettings = ReaderSettings {
        renewal: RenewalPolicy {
            interval: Duration::from_secs(1800),
            deadline: Duration::from_secs(1810),
            failure_deadline: Duration::from_secs(1),
        },
        stale_after: Duration::from_secs(3600),
    };

    fn frame(kind: &str, age: chrono::Duration) -> StreamResult<String> {
        Ok(json!({"e": kind, "E": (Utc::now() - age).timestamp_millis()}).to_string())
    }

    fn reader(
        connector: ScriptedConnector,
        fail_renewals: bool,
    ) -> (StreamReader, mpsc::UnboundedReceiver<RawEvent>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let reader = StreamReader::new(
            Arc::new(connector),
            Arc::new(StaticKeys { fail_renewals }),
            tx,
            SETTINGS,
            shutdown.clone(),
        );
        (reader, rx, shutdown)
    }

    #[tokio::test]
    async fn test_dial_failure_terminates_immediately() {
        let (reader, _rx, _shutdown) = reader(
            ScriptedConnector::new(vec![Err(StreamError::Dial("refused".into()))]),
            false,
        );
        assert_eq!(reader.state(), ReaderState::Connecting);
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(termination, Termination::Failed(StreamError::Dial(_))));
    }

    #[tokio::test]
    async fn test_forwards_fresh_records_in_order_and_drops_stale() {
        let frames = vec![
            frame("ACCOUNT_UPDATE", chrono::Duration::seconds(1)),
            frame("ACCOUNT_UPDATE", chrono::Duration::minutes(61)),
            frame("ORDER_TRADE_UPDATE", chrono::Duration::minutes(59)),
            Err(StreamError::Read("reset by peer".into())),
        ];
        let (reader, mut rx, _shutdown) = reader(ScriptedConnector::new(vec![Ok(frames)]), false);
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(termination, Termination::Failed(StreamError::Read(_))));

        assert_eq!(rx.recv().await.unwrap().kind(), Some("ACCOUNT_UPDATE"));
        assert_eq!(rx.recv().await.unwrap().kind(), Some("ORDER_TRADE_UPDATE"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decode_error_terminates() {
        let frames = vec![Ok("{not json".to_string())];
        let (reader, _rx, _shutdown) = reader(ScriptedConnector::new(vec![Ok(frames)]), false);
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(termination, Termination::Failed(StreamError::Decode(_))));
    }

    #[tokio::test]
    async fn test_listen_key_expired_terminates() {
        let frames = vec![frame(LISTEN_KEY_EXPIRED, chrono::Duration::zero())];
        let (reader, mut rx, _shutdown) = reader(ScriptedConnector::new(vec![Ok(frames)]), false);
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(
            termination,
            Termination::Failed(StreamError::SessionExpired)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_hits_read_deadline() {
        let (reader, _rx, _shutdown) = reader(ScriptedConnector::new(vec![Ok(vec![])]), false);
        let started = tokio::time::Instant::now();
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(
            termination,
            Termination::Failed(StreamError::DeadlineExpired)
        ));
        assert!(started.elapsed() >= Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_forces_early_timeout() {
        let (reader, _rx, _shutdown) = reader(ScriptedConnector::new(vec![Ok(vec![])]), true);
        let started = tokio::time::Instant::now();
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(
            termination,
            Termination::Failed(StreamError::DeadlineExpired)
        ));
        // renewal at 30 min fails, deadline pulled in to one second later
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1800));
        assert!(elapsed < Duration::from_secs(1805));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_times_out_busy_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = StreamReader::new(
            Arc::new(BusyConnector),
            Arc::new(StaticKeys {
                fail_renewals: true,
            }),
            tx,
            SETTINGS,
            CancellationToken::new(),
        );
        let started = tokio::time::Instant::now();
        let termination = reader.run(ListenKey::new("key")).await;
        assert!(matches!(
            termination,
            Termination::Failed(StreamError::DeadlineExpired)
        ));
        // frames kept arriving, yet the capped deadline still fired
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1800));
        assert!(elapsed < Duration::from_secs(1805));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_streaming() {
        let (reader, _rx, shutdown) = reader(ScriptedConnector::new(vec![Ok(vec![])]), false);
        let handle = tokio::spawn(reader.run(ListenKey::new("key")));
        tokio::task::yield_now().await;
        shutdown.cancel();
        let termination = handle.await.unwrap();
        assert!(matches!(termination, Termination::Shutdown));
    }
}
