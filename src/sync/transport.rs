// sync/transport.rs - Transport seam and inbound routing
//
// The engine assumes an established duplex message channel; connection
// setup and credentials belong to the pairing layer. Envelopes travel on
// named logical channels with FIFO ordering per channel.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sync::events::SyncEvent;
use crate::{Error, Result};

/// The logical channel the sync engine sends and receives on.
pub const SYNC_CHANNEL: &str = "sync";

/// Outbound half of the transport.
///
/// A failed send is terminal for the running session; the engine never
/// retries in place.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send_event(&self, channel: &str, event: SyncEvent) -> Result<()>;
}

/// Routes inbound envelopes to per-channel mailboxes.
///
/// The connection layer calls `dispatch` for every received envelope;
/// consumers register a channel once and drain their receiver.
#[derive(Default)]
pub struct InboundRouter {
    channels: Mutex<HashMap<String, mpsc::Sender<SyncEvent>>>,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous registration.
    pub fn register(&self, channel: &str, capacity: usize) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(channel.to_string(), tx);
        rx
    }

    /// Deliver one envelope to its channel's mailbox.
    ///
    /// Envelopes for unregistered channels are dropped with a warning;
    /// other subsystems own their own routing.
    pub async fn dispatch(&self, channel: &str, event: SyncEvent) -> Result<()> {
        let sender = {
            let channels = self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            channels.get(channel).cloned()
        };

        match sender {
            Some(sender) => sender
                .send(event)
                .await
                .map_err(|_| Error::Transport(format!("channel {channel} closed"))),
            None => {
                tracing::warn!("Dropping event for unregistered channel: {}", channel);
                Ok(())
            }
        }
    }
}

/// In-process transport half backed by an mpsc channel.
///
/// The receiver side yields `(channel, event)` pairs; wiring two of these
/// back to back gives tests a full duplex link.
pub struct ChannelTransport {
    sender: mpsc::Sender<(String, SyncEvent)>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(String, SyncEvent)>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SyncTransport for ChannelTransport {
    async fn send_event(&self, channel: &str, event: SyncEvent) -> Result<()> {
        self.sender
            .send((channel.to_string(), event))
            .await
            .map_err(|_| Error::Transport("peer connection closed".to_string()))
    }
}
