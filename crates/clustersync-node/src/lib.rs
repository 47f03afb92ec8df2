//! Cluster connections and the frame-lock protocol.
//!
//! This is the layer applications talk to. A [`ConnectionManager`] owns one
//! [`Connection`] per peer link, classifies them into sync, data-transfer and
//! external-control roles, and keeps every node presenting the same frame:
//!
//! - the master broadcasts frame N and waits in
//!   [`ConnectionManager::frame_lock_post_stage`] until every client answered
//! - a client waits in [`ConnectionManager::frame_lock_pre_stage`] until the
//!   master's frame N arrived, then acknowledges it
//!
//! Waits never stall forever: they give up after the configured sync timeout
//! and report [`SyncOutcome::TimedOut`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod connection;
pub mod error;
pub mod external;
pub mod framelock;
pub mod manager;
pub mod role;
pub mod topology;

pub use config::{ConnectionOptions, ManagerConfig, NetworkMode};
pub use connection::{Connection, StatusListener};
pub use error::{NodeError, Result};
pub use external::{send_command, AsciiCommandParser, ParsedInput, GREETING, REPLY_OK};
pub use framelock::{FrameState, LockMode, SyncOutcome, SyncSignal, FRAME_COUNTER_MODULUS};
pub use manager::ConnectionManager;
pub use role::{
    ConnectionRole, ControlHandler, ControlMode, DataTransferHandler, Handlers, RoleHandler, Side,
    SyncHandler,
};
pub use topology::{NodeAddress, PlannedConnection, Topology};

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
