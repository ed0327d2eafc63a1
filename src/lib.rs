#![allow(clippy::too_many_arguments)]

pub mod apx_client;
pub mod config;
pub mod errors;
pub mod queue;
pub mod types;
pub mod user_data;
pub mod ws_client;

pub use apx_client::{ApxClient, ApxClientBuilder, Error as ApxError, Result as ApxResult};
pub use config::UserDataConfig;
pub use errors::{
    ErrorNotice, PendingErrors, QueueClosed, RestError, RestResult, StreamError, StreamResult,
};
pub use queue::OverwriteQueue;
pub use types::{
    AccountSnapshot, ApiCredentials, BalanceRecord, ListenKey, OrderId, PositionRecord, TradeFill,
};
pub use user_data::{
    AccountMirror, ListenKeyProvider, LocalUserData, SnapshotSource, UserDataEvent,
    UserDataSources,
};
pub use ws_client::{MessageStream, StreamConnector, WsConnection, WsConnector};
