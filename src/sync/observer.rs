// sync/observer.rs - Lifecycle and progress notifications
//
// Observers subscribe through a broadcast channel; a session emits
// started, then any number of progress notifications, then exactly one
// terminal (completed, error or rejected).

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::sync::session::SessionSnapshot;

/// Observable sync lifecycle notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SyncNotification {
    Started { session: SessionSnapshot },
    Progress { session: SessionSnapshot },
    Completed { session: SessionSnapshot },
    Error { message: String },
    Rejected { payload: Value },
}

impl SyncNotification {
    /// Stable event name, matching what the host application surfaces.
    pub fn name(&self) -> &'static str {
        match self {
            SyncNotification::Started { .. } => "sync:started",
            SyncNotification::Progress { .. } => "sync:progress",
            SyncNotification::Completed { .. } => "sync:completed",
            SyncNotification::Error { .. } => "sync:error",
            SyncNotification::Rejected { .. } => "sync:rejected",
        }
    }
}

/// Fan-out publisher for sync notifications.
///
/// Slow subscribers may observe lag, never block the engine.
#[derive(Clone)]
pub struct SyncObserver {
    sender: broadcast::Sender<SyncNotification>,
}

impl SyncObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, notification: SyncNotification) {
        tracing::debug!("Emitting {}", notification.name());
        // No subscribers is fine
        let _ = self.sender.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::session::SyncPhase;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some("s-1".to_string()),
            phase: SyncPhase::ServerSending,
            start_time_unix: 100,
            records_sent: 1,
            records_received: 2,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_notifications_in_order() {
        let observer = SyncObserver::new(16);
        let mut rx = observer.subscribe();

        observer.emit(SyncNotification::Started { session: snapshot() });
        observer.emit(SyncNotification::Completed { session: snapshot() });

        assert_eq!(rx.recv().await.unwrap().name(), "sync:started");
        assert_eq!(rx.recv().await.unwrap().name(), "sync:completed");
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_harmless() {
        let observer = SyncObserver::new(16);
        observer.emit(SyncNotification::Error {
            message: "boom".to_string(),
        });
    }
}
