// sync/session.rs - Per-session protocol state
//
// A session object exists only while a sync run is active; the engine
// holds `Option<SyncSession>` and `None` means IDLE. All mutation happens
// on the engine's driver task.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::sync::reader::OutgoingQueue;
use crate::sync::record::ChangeRecord;
use crate::{Error, Result};

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Idle,
    ServerSending,
    ClientSending,
    Finalizing,
}

/// The one outstanding `SYNC_DATA` awaiting its confirmation.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub event_id: String,
}

/// Observable session counters handed to observers with every
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub phase: SyncPhase,
    pub start_time_unix: i64,
    pub records_sent: u64,
    pub records_received: u64,
}

/// State of one end-to-end sync run.
pub struct SyncSession {
    /// Assigned by the host when it accepts the request.
    pub session_id: Option<String>,
    phase: SyncPhase,
    /// Captured at initiation; becomes the new watermark on success.
    pub start_time_unix: i64,
    /// The watermark this session syncs against.
    pub last_sync_timestamp: i64,
    pub records_sent: u64,
    pub records_received: u64,
    /// Host-sent records awaiting the atomic apply.
    pub incoming_buffer: Vec<ChangeRecord>,
    pending_confirmation: Option<PendingConfirmation>,
    /// Local-change cursor, present only during CLIENT_SENDING.
    pub outgoing: Option<OutgoingQueue>,
    pub local_changes_sent: bool,
    pub remote_complete_received: bool,
    pub finalize_sent: bool,
    deadline: Instant,
    timeout: Duration,
}

impl SyncSession {
    /// New session in the request-accept window; phase stays IDLE until
    /// the host accepts.
    pub fn new(start_time_unix: i64, last_sync_timestamp: i64, timeout: Duration) -> Self {
        Self {
            session_id: None,
            phase: SyncPhase::Idle,
            start_time_unix,
            last_sync_timestamp,
            records_sent: 0,
            records_received: 0,
            incoming_buffer: Vec::new(),
            pending_confirmation: None,
            outgoing: None,
            local_changes_sent: false,
            remote_complete_received: false,
            finalize_sent: false,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SyncPhase) {
        tracing::debug!("Session phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// The instant at which the session times out absent peer activity.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Push the deadline out after session activity.
    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Occupy the confirmation slot for an outbound `SYNC_DATA`.
    ///
    /// At most one confirmation may be outstanding; a second registration
    /// while one is pending is a programming error.
    pub fn begin_confirmation(&mut self, event_id: String) -> Result<()> {
        if let Some(pending) = &self.pending_confirmation {
            return Err(Error::Internal(format!(
                "confirmation already pending for event {}",
                pending.event_id
            )));
        }
        self.pending_confirmation = Some(PendingConfirmation { event_id });
        Ok(())
    }

    /// Release the slot if `event_id` matches the outstanding send.
    pub fn take_confirmation(&mut self, event_id: &str) -> Option<PendingConfirmation> {
        if self
            .pending_confirmation
            .as_ref()
            .is_some_and(|pending| pending.event_id == event_id)
        {
            self.pending_confirmation.take()
        } else {
            None
        }
    }

    pub fn has_pending_confirmation(&self) -> bool {
        self.pending_confirmation.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            start_time_unix: self.start_time_unix,
            records_sent: self.records_sent,
            records_received: self.records_received,
        }
    }
}
