//! Local mirror of the futures user data stream.
//!
//! The account is rebuilt from two sources that fail independently: periodic REST
//! snapshots and the push stream opened with a renewable listen key. Consumers only see
//! [`LocalUserData`].

pub mod dispatcher;
pub mod events;
pub mod local;
pub mod mirror;
pub mod reader;
pub mod session;
pub mod sources;
pub mod supervisor;

pub use dispatcher::{EventDispatcher, RefreshInterval, SnapshotRefresher};
pub use events::{AccountUpdate, BalanceUpdate, PositionUpdate, RawEvent, UserDataEvent};
pub use local::LocalUserData;
pub use mirror::AccountMirror;
pub use reader::{ReaderSettings, ReaderState, StreamReader, Termination};
pub use session::{keep_alive, ReadDeadline, RenewalPolicy};
pub use sources::{ListenKeyProvider, SnapshotSource, UserDataSources};
pub use supervisor::{ReconnectSupervisor, SupervisorSettings};
