// sync/engine.rs - Protocol state machine and driver task
//
// One spawned task owns all protocol state and serializes every mutation:
// commands and inbound envelopes arrive through mailboxes, and the task
// suspends only on its own awaits (transport sends, the atomic apply,
// change-reader I/O, the watermark write). Outbound SYNC_DATA is strictly
// one-in-flight: the next record is sent only after the previous one's
// confirmation arrived.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::sync::applier::RecordApplier;
use crate::sync::events::{
    EventStatus, EventType, SessionPayload, SyncAcceptPayload, SyncDataConfirmPayload,
    SyncDataPayload, SyncEvent, SyncRequestPayload,
};
use crate::sync::observer::{SyncNotification, SyncObserver};
use crate::sync::reader::{ChangeReader, OutgoingQueue};
use crate::sync::record::ChangeRecord;
use crate::sync::session::{SyncPhase, SyncSession};
use crate::sync::transport::{SyncTransport, SYNC_CHANNEL};
use crate::sync::watermark::WatermarkStore;
use crate::{Error, Result};

/// Engine construction parameters.
pub struct SyncConfig {
    pub device: DeviceInfo,
    /// Deadline for peer activity, including each pending confirmation.
    pub confirmation_timeout: Duration,
    /// BLOBs up to this size are fetched in one read.
    pub blob_inline_limit: i64,
    /// Window size for chunked BLOB reads.
    pub blob_chunk_size: i64,
    /// Logical transport channel the engine speaks on.
    pub channel: String,
    pub mailbox_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device: DeviceInfo::detect("desktop"),
            confirmation_timeout: Duration::from_secs(30),
            blob_inline_limit: 2 * 1024 * 1024,
            blob_chunk_size: 1024 * 1024,
            channel: SYNC_CHANNEL.to_string(),
            mailbox_capacity: 64,
            notification_capacity: 256,
        }
    }
}

enum EngineCommand {
    InitiateSync { reply: oneshot::Sender<Result<()>> },
    Cancel,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct SyncEngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    observer: SyncObserver,
}

impl SyncEngineHandle {
    /// Ask the engine to start a sync run.
    ///
    /// Resolves once the `SYNC_REQUEST` went out; progress and the
    /// terminal outcome arrive through `subscribe`.
    pub async fn initiate_sync(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::InitiateSync { reply: reply_tx })
            .await
            .map_err(|_| Error::Internal("sync engine is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("sync engine dropped the request".to_string()))?
    }

    /// Abort the running session, if any. The watermark is left alone.
    pub async fn cancel(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Cancel)
            .await
            .map_err(|_| Error::Internal("sync engine is not running".to_string()))
    }

    /// Subscribe to lifecycle and progress notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.observer.subscribe()
    }
}

/// The protocol engine. Constructed with `spawn`, driven by its own task.
pub struct SyncEngine {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    reader: ChangeReader,
    applier: RecordApplier,
    watermark: WatermarkStore,
    observer: SyncObserver,
    session: Option<SyncSession>,
    inbound: mpsc::Receiver<SyncEvent>,
    commands: mpsc::Receiver<EngineCommand>,
}

impl SyncEngine {
    /// Spawn the engine task and return its handle.
    ///
    /// `inbound` is the mailbox of envelopes the transport received on the
    /// sync channel, typically from `InboundRouter::register`.
    pub fn spawn(
        pool: SqlitePool,
        transport: Arc<dyn SyncTransport>,
        inbound: mpsc::Receiver<SyncEvent>,
        config: SyncConfig,
    ) -> SyncEngineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(config.mailbox_capacity);
        let observer = SyncObserver::new(config.notification_capacity);

        let engine = SyncEngine {
            reader: ChangeReader::new(pool.clone(), config.blob_inline_limit, config.blob_chunk_size),
            applier: RecordApplier::new(pool.clone()),
            watermark: WatermarkStore::new(pool),
            transport,
            observer: observer.clone(),
            config,
            session: None,
            inbound,
            commands: commands_rx,
        };
        tokio::spawn(engine.run());

        SyncEngineHandle {
            commands: commands_tx,
            observer,
        }
    }

    async fn run(mut self) {
        info!("Sync engine started");
        loop {
            let deadline = self
                .session
                .as_ref()
                .map(|session| session.deadline())
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::InitiateSync { reply }) => {
                        let result = self.initiate_sync().await;
                        let _ = reply.send(result);
                    }
                    Some(EngineCommand::Cancel) => self.cancel().await,
                    None => break,
                },
                event = self.inbound.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            self.abort_session(err).await;
                        }
                    }
                    None => {
                        if self.session.is_some() {
                            self.abort_session(Error::Transport(
                                "sync channel closed".to_string(),
                            ))
                            .await;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline), if self.session.is_some() => {
                    self.abort_session(Error::Timeout(
                        "no peer activity within the session deadline".to_string(),
                    ))
                    .await;
                }
            }
        }
        info!("Sync engine stopped");
    }

    fn session_mut(&mut self) -> Result<&mut SyncSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Internal("no active sync session".to_string()))
    }

    fn phase(&self) -> SyncPhase {
        self.session
            .as_ref()
            .map(|session| session.phase())
            .unwrap_or(SyncPhase::Idle)
    }

    fn session_matches(&self, sync_session_id: &str) -> bool {
        self.session
            .as_ref()
            .and_then(|session| session.session_id.as_deref())
            == Some(sync_session_id)
    }

    async fn send(&self, event: SyncEvent) -> Result<()> {
        self.transport.send_event(&self.config.channel, event).await
    }

    /// Start a session: capture `start_time_unix`, read the watermark and
    /// send `SYNC_REQUEST`. The session enters SERVER_SENDING only once
    /// the host accepts.
    async fn initiate_sync(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::Protocol(
                "a sync session is already in progress".to_string(),
            ));
        }

        let last_sync_timestamp = self.watermark.last_sync_timestamp().await?;
        let now = Utc::now().timestamp();

        let payload = SyncRequestPayload {
            device_id: self.config.device.device_id.clone(),
            device_name: self.config.device.device_name.clone(),
            device_type: self.config.device.device_type.clone(),
            device_platform: self.config.device.device_platform.clone(),
            current_utc_timestamp: now,
            last_sync_timestamp,
        };
        let event = SyncEvent::new(
            EventType::SyncRequest,
            EventStatus::New,
            serde_json::to_value(&payload)?,
        );

        self.session = Some(SyncSession::new(
            now,
            last_sync_timestamp,
            self.config.confirmation_timeout,
        ));
        if let Err(err) = self.send(event).await {
            self.session = None;
            return Err(err);
        }

        info!(last_sync_timestamp, "Sync requested");
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) -> Result<()> {
        let Some(kind) = event.kind() else {
            debug!("Ignoring unknown event type: {}", event.event_type);
            return Ok(());
        };
        if event.status == EventStatus::Pending {
            debug!("Ignoring transport ack for {}", event.event_type);
            return Ok(());
        }

        match kind {
            EventType::SyncRequest | EventType::SyncAccept => {
                self.handle_request_response(event).await
            }
            EventType::SyncData => self.handle_data(event).await,
            EventType::SyncDataConfirm => self.handle_data_confirm(event).await,
            EventType::SyncComplete => self.handle_complete(event).await,
            EventType::SyncFinalize => self.handle_finalize(event).await,
            EventType::SyncReject => self.handle_reject(event),
            EventType::SyncStart => {
                debug!("Ignoring inbound SYNC_START");
                Ok(())
            }
        }
    }

    /// The host's answer to our `SYNC_REQUEST`: acceptance carries the
    /// assigned session id, an error status is a refusal.
    async fn handle_request_response(&mut self, event: SyncEvent) -> Result<()> {
        if self.session.is_none() {
            debug!("Ignoring {} with no sync in progress", event.event_type);
            return Ok(());
        }
        if self.phase() != SyncPhase::Idle {
            debug!(
                "Ignoring {} in phase {:?}",
                event.event_type,
                self.phase()
            );
            return Ok(());
        }

        if event.status == EventStatus::Error {
            warn!("Sync request refused by peer");
            self.session = None;
            self.observer.emit(SyncNotification::Rejected {
                payload: event.payload,
            });
            return Ok(());
        }

        let accept: SyncAcceptPayload = match serde_json::from_value(event.payload) {
            Ok(payload) => payload,
            Err(_) => {
                warn!("Ignoring {} without a session id", event.event_type);
                return Ok(());
            }
        };
        if let Some(drift) = accept.clock_drift_seconds {
            if drift != 0 {
                debug!("Peer reports clock drift of {}s", drift);
            }
        }

        let session = self.session_mut()?;
        session.session_id = Some(accept.sync_session_id.clone());
        session.incoming_buffer.clear();
        session.set_phase(SyncPhase::ServerSending);
        session.touch();
        let snapshot = session.snapshot();

        info!(session_id = %accept.sync_session_id, "Sync session accepted");
        self.observer
            .emit(SyncNotification::Started { session: snapshot });

        let start = SyncEvent::new(
            EventType::SyncStart,
            EventStatus::New,
            serde_json::to_value(&SessionPayload {
                sync_session_id: accept.sync_session_id,
            })?,
        );
        self.send(start).await
    }

    /// Host record during SERVER_SENDING: validate, buffer, confirm.
    /// Apply happens later, atomically, on the host's `SYNC_COMPLETE`.
    async fn handle_data(&mut self, event: SyncEvent) -> Result<()> {
        if self.session.is_none() {
            debug!("Ignoring SYNC_DATA with no sync in progress");
            return Ok(());
        }
        if self.phase() != SyncPhase::ServerSending {
            debug!("Ignoring SYNC_DATA in phase {:?}", self.phase());
            return Ok(());
        }
        if event.status != EventStatus::New {
            debug!("Ignoring SYNC_DATA with status {:?}", event.status);
            return Ok(());
        }

        let payload: SyncDataPayload = serde_json::from_value(event.payload)
            .map_err(|e| Error::Transport(format!("malformed SYNC_DATA payload: {e}")))?;
        let SyncDataPayload {
            sync_session_id,
            event_id,
            table,
            operation,
            record,
        } = payload;
        if !self.session_matches(&sync_session_id) {
            warn!("Ignoring SYNC_DATA for stale session {}", sync_session_id);
            return Ok(());
        }

        let change = ChangeRecord {
            table,
            operation,
            record,
        };
        if let Err(err) = RecordApplier::validate(&change) {
            warn!("Rejecting incoming record for {}: {}", change.table, err);
            self.send_data_confirm(
                sync_session_id,
                event_id,
                EventStatus::Error,
                Some(err.to_string()),
            )
            .await?;
            return Err(err);
        }

        let session = self.session_mut()?;
        session.incoming_buffer.push(change);
        session.records_received += 1;
        session.touch();
        let snapshot = session.snapshot();
        debug!(
            "Buffered incoming record ({} so far)",
            snapshot.records_received
        );
        self.observer
            .emit(SyncNotification::Progress { session: snapshot });

        self.send_data_confirm(sync_session_id, event_id, EventStatus::Success, None)
            .await
    }

    async fn send_data_confirm(
        &self,
        sync_session_id: String,
        event_id: String,
        status: EventStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let payload = SyncDataConfirmPayload {
            sync_session_id,
            event_id,
            status,
            error_message,
        };
        let event = SyncEvent::new(
            EventType::SyncDataConfirm,
            status,
            serde_json::to_value(&payload)?,
        );
        self.send(event).await
    }

    /// Peer confirmation for our outstanding `SYNC_DATA`.
    async fn handle_data_confirm(&mut self, event: SyncEvent) -> Result<()> {
        if self.phase() != SyncPhase::ClientSending {
            debug!("Ignoring SYNC_DATA_CONFIRM in phase {:?}", self.phase());
            return Ok(());
        }

        let payload: SyncDataConfirmPayload = serde_json::from_value(event.payload)
            .map_err(|e| Error::Transport(format!("malformed SYNC_DATA_CONFIRM payload: {e}")))?;
        if !self.session_matches(&payload.sync_session_id) {
            warn!(
                "Ignoring SYNC_DATA_CONFIRM for stale session {}",
                payload.sync_session_id
            );
            return Ok(());
        }

        let session = self.session_mut()?;
        if session.take_confirmation(&payload.event_id).is_none() {
            warn!("Confirmation for unexpected event {}", payload.event_id);
            return Ok(());
        }

        match payload.status {
            EventStatus::Success => {
                session.records_sent += 1;
                session.touch();
                let snapshot = session.snapshot();
                self.observer
                    .emit(SyncNotification::Progress { session: snapshot });
                self.send_next_record().await
            }
            _ => Err(Error::Rejected(payload.error_message.unwrap_or_else(
                || "peer reported a data error".to_string(),
            ))),
        }
    }

    /// Send the next local change, or `SYNC_COMPLETE` once drained.
    async fn send_next_record(&mut self) -> Result<()> {
        let next = self
            .session_mut()?
            .outgoing
            .as_mut()
            .ok_or_else(|| Error::Internal("no outgoing queue".to_string()))?
            .next();

        match next {
            Some(change) => {
                let session = self.session_mut()?;
                let sync_session_id = session
                    .session_id
                    .clone()
                    .ok_or_else(|| Error::Internal("session has no id".to_string()))?;
                let event_id = Uuid::new_v4().to_string();
                session.begin_confirmation(event_id.clone())?;
                session.touch();

                let payload = SyncDataPayload {
                    sync_session_id,
                    event_id: event_id.clone(),
                    table: change.table,
                    operation: change.operation,
                    record: change.record,
                };
                let event = SyncEvent::with_event_id(
                    event_id,
                    EventType::SyncData,
                    EventStatus::New,
                    serde_json::to_value(&payload)?,
                );
                self.send(event).await?;
                debug!(
                    "Sent {} record for {}",
                    payload.operation.as_str(),
                    payload.table
                );
                Ok(())
            }
            None => {
                let session = self.session_mut()?;
                session.outgoing = None;
                session.local_changes_sent = true;
                session.touch();
                let sync_session_id = session
                    .session_id
                    .clone()
                    .ok_or_else(|| Error::Internal("session has no id".to_string()))?;
                info!(records_sent = session.records_sent, "Local changes drained");

                let event = SyncEvent::new(
                    EventType::SyncComplete,
                    EventStatus::New,
                    serde_json::to_value(&SessionPayload { sync_session_id })?,
                );
                self.send(event).await?;
                self.maybe_finalize().await
            }
        }
    }

    /// Inbound `SYNC_COMPLETE`. During SERVER_SENDING this is the host
    /// finishing its stream; during CLIENT_SENDING it acknowledges ours.
    async fn handle_complete(&mut self, event: SyncEvent) -> Result<()> {
        if self.session.is_none() {
            debug!("Ignoring SYNC_COMPLETE with no sync in progress");
            return Ok(());
        }
        let payload: SessionPayload = serde_json::from_value(event.payload)
            .map_err(|e| Error::Transport(format!("malformed SYNC_COMPLETE payload: {e}")))?;
        if !self.session_matches(&payload.sync_session_id) {
            warn!(
                "Ignoring SYNC_COMPLETE for stale session {}",
                payload.sync_session_id
            );
            return Ok(());
        }

        match (self.phase(), event.status) {
            (SyncPhase::ServerSending, EventStatus::New) => self.apply_incoming_and_switch().await,
            (SyncPhase::ClientSending, EventStatus::Success) => {
                let session = self.session_mut()?;
                session.remote_complete_received = true;
                session.touch();
                self.maybe_finalize().await
            }
            (phase, status) => {
                debug!(
                    "Ignoring SYNC_COMPLETE with status {:?} in phase {:?}",
                    status, phase
                );
                Ok(())
            }
        }
    }

    /// Atomic apply of the incoming buffer, then switch to sending local
    /// changes.
    ///
    /// The outgoing snapshot is taken first so the rows applied here do
    /// not count as local changes of this session.
    async fn apply_incoming_and_switch(&mut self) -> Result<()> {
        let (records, since) = {
            let session = self.session_mut()?;
            (
                std::mem::take(&mut session.incoming_buffer),
                session.last_sync_timestamp,
            )
        };

        let outgoing = OutgoingQueue::snapshot(&self.reader, since).await?;
        info!(
            "Peer finished sending; applying {} buffered records, {} local changes to send",
            records.len(),
            outgoing.len()
        );
        // Buffer is cleared already; a failed apply leaves nothing behind
        self.applier.apply_all(&records).await?;

        let session = self.session_mut()?;
        session.set_phase(SyncPhase::ClientSending);
        session.outgoing = Some(outgoing);
        session.touch();

        self.send_next_record().await
    }

    /// Send `SYNC_FINALIZE` once both completion flags are set.
    ///
    /// Finalize is sent at most once per session; a second attempt is a
    /// protocol error surfaced to the caller rather than suppressed.
    async fn maybe_finalize(&mut self) -> Result<()> {
        let session = self.session_mut()?;
        if !(session.local_changes_sent && session.remote_complete_received) {
            return Ok(());
        }
        if session.finalize_sent {
            return Err(Error::Protocol("sync finalize already sent".to_string()));
        }
        session.finalize_sent = true;
        session.set_phase(SyncPhase::Finalizing);
        session.touch();
        let sync_session_id = session
            .session_id
            .clone()
            .ok_or_else(|| Error::Internal("session has no id".to_string()))?;

        info!("Finalizing sync session");
        let event = SyncEvent::new(
            EventType::SyncFinalize,
            EventStatus::New,
            serde_json::to_value(&SessionPayload { sync_session_id })?,
        );
        self.send(event).await
    }

    /// Peer acknowledgment of our `SYNC_FINALIZE`: the session is done and
    /// the watermark advances to this session's start time.
    async fn handle_finalize(&mut self, event: SyncEvent) -> Result<()> {
        if self.session.is_none() {
            debug!("Ignoring SYNC_FINALIZE with no sync in progress");
            return Ok(());
        }
        let payload: SessionPayload = serde_json::from_value(event.payload)
            .map_err(|e| Error::Transport(format!("malformed SYNC_FINALIZE payload: {e}")))?;
        if !self.session_matches(&payload.sync_session_id) {
            warn!(
                "Ignoring SYNC_FINALIZE for stale session {}",
                payload.sync_session_id
            );
            return Ok(());
        }
        if self.phase() != SyncPhase::Finalizing {
            debug!("Ignoring SYNC_FINALIZE in phase {:?}", self.phase());
            return Ok(());
        }

        match event.status {
            EventStatus::Success | EventStatus::Done => self.complete_session().await,
            EventStatus::Error => Err(Error::Rejected(
                "peer failed to finalize the session".to_string(),
            )),
            status => {
                debug!("Ignoring SYNC_FINALIZE with status {:?}", status);
                Ok(())
            }
        }
    }

    async fn complete_session(&mut self) -> Result<()> {
        let session = self
            .session
            .take()
            .ok_or_else(|| Error::Internal("no active sync session".to_string()))?;
        let snapshot = session.snapshot();
        info!(
            records_sent = snapshot.records_sent,
            records_received = snapshot.records_received,
            "Sync session completed"
        );
        self.observer
            .emit(SyncNotification::Completed { session: snapshot });

        // Written last: after the apply committed and completion was
        // announced. A failed write keeps the old watermark and the next
        // session re-ships at most what this one already reconciled.
        if let Err(err) = self
            .watermark
            .set_last_sync_timestamp(session.start_time_unix)
            .await
        {
            error!("Failed to persist sync watermark: {}", err);
        }
        Ok(())
    }

    /// Inbound `SYNC_REJECT` is terminal in every phase.
    fn handle_reject(&mut self, event: SyncEvent) -> Result<()> {
        if self.session.is_none() {
            debug!("Ignoring SYNC_REJECT with no sync in progress");
            return Ok(());
        }
        warn!("Sync rejected by peer");
        self.session = None;
        self.observer.emit(SyncNotification::Rejected {
            payload: event.payload,
        });
        Ok(())
    }

    async fn cancel(&mut self) {
        if self.session.is_none() {
            debug!("Cancel requested with no sync in progress");
            return;
        }
        info!("Cancelling sync session");
        self.abort_session(Error::Cancelled).await;
    }

    /// Terminal failure path: destroy the session, drop the buffer and any
    /// pending confirmation, leave the watermark untouched.
    async fn abort_session(&mut self, err: Error) {
        error!("Sync session failed: {}", err);
        if let Some(mut session) = self.session.take() {
            session.incoming_buffer.clear();
        }
        self.observer.emit(SyncNotification::Error {
            message: err.to_string(),
        });
    }
}
