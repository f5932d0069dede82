// sync/mod.rs - Bidirectional sync engine
//
// Reconciles the local store with a host peer over a duplex message
// channel: exchange all changes since the last watermark, apply incoming
// rows atomically with last-write-wins, advance the watermark only when
// both sides finalize.

pub mod applier;
pub mod engine;
pub mod events;
pub mod observer;
pub mod reader;
pub mod record;
pub mod session;
pub mod tables;
pub mod transport;
pub mod watermark;

pub use engine::{SyncConfig, SyncEngine, SyncEngineHandle};
pub use observer::SyncNotification;
pub use session::{SessionSnapshot, SyncPhase};
