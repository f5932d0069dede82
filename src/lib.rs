// lib.rs - Main library entry point
//
// Sync engine core for the companion desktop app: reconciles the local
// SQLite store with a paired host peer over an established duplex message
// channel. The surrounding application owns the UI, pairing and the
// connection itself; it hands the engine a pool, a transport and the
// inbound sync mailbox, then drives it through the returned handle.

pub mod db;
pub mod device;
mod error;
pub mod sync;

pub use db::Database;
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use sync::engine::{SyncConfig, SyncEngine, SyncEngineHandle};
pub use sync::events::{EventStatus, EventType, SyncEvent};
pub use sync::observer::SyncNotification;
pub use sync::session::{SessionSnapshot, SyncPhase};
pub use sync::transport::{ChannelTransport, InboundRouter, SyncTransport, SYNC_CHANNEL};
