//! Editing sessions: one attached document per session.
//!
//! ```text
//!  host UI ──SessionHandle──► commands ─┐
//!                                        ▼
//!                          ┌──────────── session loop ────────────┐
//!                          │ Document · AwarenessStore · Binding  │
//!                          │ PresenceSurface · Supervisor         │
//!                          └───────┬──────────────────▲───────────┘
//!                                  │ SyncMessage      │ TransportEvent
//!                                  ▼                  │
//!                               transport task ◄──► relay
//! ```
//!
//! The loop is the single owner of every piece of mutable state. The host
//! talks to it through [`SessionHandle`] and hears back through
//! [`SessionEvent`]s and the connection status `watch` channel.

use log::{debug, error, info, trace, warn};
use quill_core::{AppliedDelta, Document, DocumentConfig, DocumentError, Update};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::awareness::{AwarenessConfig, AwarenessFields, AwarenessStore, UserInfo};
use crate::binding::{EditorBinding, EditorWidget};
use crate::presence::{palette_color, PresenceSurface};
use crate::protocol::{AwarenessPayload, MessageKind, ProtocolError, SyncMessage};
use crate::storage::{SnapshotStore, StoreError};
use crate::supervisor::{ConnectionState, ConnectionStatus, ConnectionSupervisor, SupervisorConfig};
use crate::transport::{self, BackoffConfig, TransportConfig, TransportEvent, TransportHandle};

// ─── Parameters ──────────────────────────────────────────────────

/// Identity supplied by the host's authentication layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUser {
    pub id: Uuid,
    pub name: String,
    /// `#rrggbb`; a palette colour is picked when absent
    pub color: Option<String>,
}

impl LocalUser {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    fn user_info(&self) -> UserInfo {
        let color = self
            .color
            .clone()
            .unwrap_or_else(|| palette_color(self.id).to_string());
        UserInfo::new(self.id, self.name.clone(), color)
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Base WebSocket URL of the relay, e.g. `ws://127.0.0.1:9090`
    pub transport_endpoint: String,
    /// Document identifier; used verbatim as the room path
    pub document_id: String,
    pub local_user: LocalUser,
    /// Text to start from when the store has no snapshot
    pub seed_text: Option<String>,
}

impl SessionParams {
    pub fn new(
        transport_endpoint: impl Into<String>,
        document_id: impl Into<String>,
        local_user: LocalUser,
    ) -> Self {
        Self {
            transport_endpoint: transport_endpoint.into(),
            document_id: document_id.into(),
            local_user,
            seed_text: None,
        }
    }

    pub fn with_seed(mut self, text: impl Into<String>) -> Self {
        self.seed_text = Some(text.into());
        self
    }
}

/// Tunables for every component a session owns.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub document: DocumentConfig,
    pub awareness: AwarenessConfig,
    pub supervisor: SupervisorConfig,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            document: DocumentConfig::default(),
            awareness: AwarenessConfig::default(),
            supervisor: SupervisorConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            document: DocumentConfig::for_testing(),
            awareness: AwarenessConfig::for_testing(),
            supervisor: SupervisorConfig::for_testing(),
            backoff: BackoffConfig::for_testing(),
            connect_timeout: Duration::from_secs(2),
            channel_capacity: 256,
        }
    }
}

// ─── Errors & events ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Store(StoreError),
    Document(DocumentError),
    /// The peer speaks another protocol version or serves another document
    HandshakeMismatch(ProtocolError),
    AlreadyAttached(String),
    NotAttached(String),
    /// The session loop has stopped
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error: {}", e),
            Self::Document(e) => write!(f, "Document error: {}", e),
            Self::HandshakeMismatch(e) => write!(f, "Handshake mismatch: {}", e),
            Self::AlreadyAttached(id) => write!(f, "Document already attached: {}", id),
            Self::NotAttached(id) => write!(f, "Document not attached: {}", id),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote edits were replayed into the widget
    RemoteChange(AppliedDelta),
    /// Remote cursors or the online-user list changed
    PresenceChanged,
    /// The session stopped on an unrecoverable error
    Fatal(SessionError),
    /// The session ended and its snapshot was saved
    Detached { revision: u64 },
}

enum SessionCommand {
    LocalChange {
        offset: usize,
        deleted: usize,
        inserted: String,
    },
    TextReplaced(String),
    CursorMoved(usize),
    SelectionChanged {
        anchor: usize,
        head: usize,
    },
    Text(oneshot::Sender<String>),
    Snapshot(oneshot::Sender<Result<Vec<u8>, SessionError>>),
    OnlineUsers(oneshot::Sender<Vec<UserInfo>>),
    Detach(oneshot::Sender<Result<u64, SessionError>>),
}

// ─── Handle ──────────────────────────────────────────────────────

/// Host-side handle of a running session.
///
/// Dropping the handle ends the session the same way `detach` does, minus
/// the reply.
pub struct SessionHandle {
    document_id: String,
    client_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<ConnectionStatus>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Transient id of this attach, used as the replica and awareness id.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Wait until the connection reaches `state`. Returns false on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.status.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    async fn command(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(cmd).await.map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// The widget replaced `deleted` chars at `offset` with `inserted`.
    pub async fn local_change(
        &self,
        offset: usize,
        deleted: usize,
        inserted: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.command(SessionCommand::LocalChange {
            offset,
            deleted,
            inserted: inserted.into(),
        })
        .await
    }

    /// The widget reported its whole new text.
    pub async fn text_replaced(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::TextReplaced(text.into())).await
    }

    pub async fn cursor_moved(&self, offset: usize) -> Result<(), SessionError> {
        self.command(SessionCommand::CursorMoved(offset)).await
    }

    pub async fn selection_changed(&self, anchor: usize, head: usize) -> Result<(), SessionError> {
        self.command(SessionCommand::SelectionChanged { anchor, head }).await
    }

    /// Current document text.
    pub async fn text(&self) -> Result<String, SessionError> {
        self.request(SessionCommand::Text).await
    }

    /// Export the document without ending the session.
    pub async fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        self.request(SessionCommand::Snapshot).await?
    }

    /// Local user first, then remote users.
    pub async fn online_users(&self) -> Result<Vec<UserInfo>, SessionError> {
        self.request(SessionCommand::OnlineUsers).await
    }

    /// End the session. Returns the revision the snapshot was saved under.
    pub async fn detach(mut self) -> Result<u64, SessionError> {
        let result = self.request(SessionCommand::Detach).await?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// ─── Session loop ────────────────────────────────────────────────

/// Entry point for attaching a document.
pub struct Session;

impl Session {
    /// Load or seed the document, then start the transport and session loop.
    pub async fn attach<W>(
        params: SessionParams,
        widget: W,
        store: Arc<dyn SnapshotStore>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError>
    where
        W: EditorWidget + Send + 'static,
    {
        let client_id = Uuid::new_v4();
        let document_id = params.document_id.clone();

        let doc = match store.load_latest(&document_id)? {
            Some(snapshot) => {
                info!(
                    "Attaching {} from revision {} as {}",
                    document_id, snapshot.revision, client_id
                );
                Document::import_snapshot_with_config(client_id, &snapshot.bytes, config.document.clone())?
            }
            None => {
                info!("Attaching new document {} as {}", document_id, client_id);
                match &params.seed_text {
                    Some(text) => Document::seeded_with_config(client_id, text, config.document.clone()),
                    None => Document::with_config(client_id, config.document.clone()),
                }
            }
        };

        let mut binding = EditorBinding::new(widget);
        binding.load(&doc);

        let awareness = AwarenessStore::new(
            client_id,
            AwarenessFields::new(params.local_user.user_info()),
            config.awareness.clone(),
        );
        let (supervisor, status) = ConnectionSupervisor::new(config.supervisor.clone());

        let transport_config = TransportConfig {
            backoff: config.backoff.clone(),
            connect_timeout: config.connect_timeout,
            channel_capacity: config.channel_capacity,
            ..TransportConfig::new(params.transport_endpoint.clone(), document_id.clone())
        };
        let (transport, transport_events) = transport::spawn(transport_config);

        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);

        let session = SessionLoop {
            document_id: document_id.clone(),
            client_id,
            doc,
            binding,
            awareness,
            presence: PresenceSurface::new(),
            supervisor,
            transport,
            store,
            events: event_tx,
        };
        let task = tokio::spawn(session.run(cmd_rx, transport_events));

        Ok(SessionHandle {
            document_id,
            client_id,
            commands: cmd_tx,
            status,
            events: Some(event_rx),
            task: Some(task),
        })
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionLoop<W: EditorWidget> {
    document_id: String,
    client_id: Uuid,
    doc: Document,
    binding: EditorBinding<W>,
    awareness: AwarenessStore,
    presence: PresenceSurface,
    supervisor: ConnectionSupervisor,
    transport: TransportHandle,
    store: Arc<dyn SnapshotStore>,
    events: mpsc::Sender<SessionEvent>,
}

impl<W: EditorWidget + Send + 'static> SessionLoop<W> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut ping = tokio::time::interval(self.supervisor.config().ping_interval);
        let mut heartbeat = tokio::time::interval(self.awareness.config().heartbeat_interval);
        let mut sweep = tokio::time::interval(self.supervisor.config().sweep_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("Handle for {} dropped, detaching", self.document_id);
                        if let Err(e) = self.shutdown().await {
                            error!("Failed to save {} on drop: {}", self.document_id, e);
                        }
                        Flow::Stop
                    }
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => self.fatal(SessionError::Closed).await,
                },
                _ = ping.tick() => {
                    self.send_ping().await;
                    Flow::Continue
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                    Flow::Continue
                }
                _ = sweep.tick() => {
                    self.sweep();
                    Flow::Continue
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        debug!("Session loop for {} stopped", self.document_id);
    }

    fn emit(&self, event: SessionEvent) {
        // The host may not be listening; never block the loop on it.
        if let Err(e) = self.events.try_send(event) {
            trace!("Session event not delivered: {}", e);
        }
    }

    async fn send(&mut self, msg: SyncMessage) {
        if let Err(e) = self.transport.send(msg).await {
            debug!("Transport unavailable: {}", e);
        }
    }

    async fn send_update(&mut self, update: &Update) {
        match update.encode() {
            Ok(bytes) => {
                self.send(SyncMessage::update(self.client_id, &self.document_id, bytes)).await;
            }
            Err(e) => error!("Failed to encode local update: {}", e),
        }
    }

    async fn send_awareness(&mut self, payload: &AwarenessPayload) {
        match SyncMessage::awareness(self.client_id, &self.document_id, payload) {
            Ok(msg) => self.send(msg).await,
            Err(e) => error!("Failed to encode awareness: {}", e),
        }
    }

    async fn flush_awareness(&mut self) {
        if let Some(payload) = self.awareness.take_dirty() {
            if self.supervisor.is_open() {
                self.send_awareness(&payload).await;
            }
        }
    }

    // ─── Host commands ───────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::LocalChange {
                offset,
                deleted,
                inserted,
            } => {
                if let Some(update) = self.binding.on_local_change(&mut self.doc, offset, deleted, &inserted) {
                    self.send_update(&update).await;
                }
            }
            SessionCommand::TextReplaced(text) => {
                if let Some(update) = self.binding.on_text_replaced(&mut self.doc, &text) {
                    self.send_update(&update).await;
                }
            }
            SessionCommand::CursorMoved(offset) => {
                let position = self.binding.cursor_moved(&self.doc, offset);
                self.awareness.update_local(|fields| {
                    fields.cursor = Some(position);
                    fields.selection = None;
                });
                self.flush_awareness().await;
            }
            SessionCommand::SelectionChanged { anchor, head } => {
                let selection = self.binding.selection_changed(&self.doc, anchor, head);
                self.awareness.update_local(|fields| {
                    fields.cursor = Some(selection.end);
                    fields.selection = (!selection.is_collapsed()).then_some(selection);
                });
                self.flush_awareness().await;
            }
            SessionCommand::Text(reply) => {
                let _ = reply.send(self.doc.text());
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.doc.export_snapshot().map_err(SessionError::from));
            }
            SessionCommand::OnlineUsers(reply) => {
                let _ = reply.send(PresenceSurface::online_users(&self.awareness));
            }
            SessionCommand::Detach(reply) => {
                let result = self.shutdown().await;
                match &result {
                    Ok(revision) => self.emit(SessionEvent::Detached { revision: *revision }),
                    Err(e) => error!("Detach of {} failed: {}", self.document_id, e),
                }
                let _ = reply.send(result);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // ─── Transport ───────────────────────────────────────────────

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Flow {
        self.supervisor.on_transport_event(&event);
        match event {
            TransportEvent::Open => {
                let sv = match self.doc.state_vector().encode() {
                    Ok(sv) => sv,
                    Err(e) => return self.fatal(SessionError::Document(e)).await,
                };
                self.send(SyncMessage::sync_step1(self.client_id, &self.document_id, sv)).await;
                self.supervisor.handshake_started();
                let state = self.awareness.local_state();
                self.send_awareness(&state).await;
                Flow::Continue
            }
            TransportEvent::Message(msg) => self.handle_message(msg).await,
            TransportEvent::Closed { reason } => {
                debug!("Connection for {} closed: {:?}", self.document_id, reason);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    async fn handle_message(&mut self, msg: SyncMessage) -> Flow {
        if let Err(e) = msg.validate(&self.document_id) {
            return self.fatal(SessionError::HandshakeMismatch(e)).await;
        }
        if let Err(e) = self.dispatch(&msg).await {
            warn!("Dropping {:?} from {}: {}", msg.kind, msg.sender, e);
        }
        Flow::Continue
    }

    async fn dispatch(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        match msg.kind {
            MessageKind::SyncStep1 => {
                let remote = msg.state_vector()?;
                let missing = self.doc.diff(&remote);
                debug!("Answering step 1 with {} ops", missing.ops.len());
                let reply = SyncMessage::sync_step2(self.client_id, &self.document_id, missing.encode()?);
                self.send(reply).await;
                self.supervisor.on_step1_answered();
            }
            MessageKind::SyncStep2 | MessageKind::SyncUpdate => {
                let update = msg.sync_update()?;
                let delta = self.doc.merge_remote(&update);
                if !delta.is_empty() {
                    self.binding.apply_remote(&delta);
                    self.emit(SessionEvent::RemoteChange(delta));
                }
                if msg.kind == MessageKind::SyncStep2 {
                    self.supervisor.on_step2_received();
                }
            }
            MessageKind::AwarenessUpdate => {
                let payload = msg.awareness_payload()?;
                if self.awareness.apply_payload(payload, Instant::now()) {
                    self.presence.render(&self.awareness, self.binding.widget_mut());
                    self.emit(SessionEvent::PresenceChanged);
                }
            }
            MessageKind::Ping => {
                let pong = SyncMessage::pong(self.client_id, &self.document_id, msg.nonce()?);
                self.send(pong).await;
            }
            MessageKind::Pong => {
                if let Some(sample) = self.supervisor.on_pong(msg.nonce()?, Instant::now()) {
                    trace!("RTT sample {:?}", sample);
                }
            }
        }
        Ok(())
    }

    // ─── Timers ──────────────────────────────────────────────────

    async fn send_ping(&mut self) {
        if !self.supervisor.is_open() {
            return;
        }
        let nonce = self.supervisor.next_ping(Instant::now());
        self.send(SyncMessage::ping(self.client_id, &self.document_id, nonce)).await;
    }

    async fn send_heartbeat(&mut self) {
        if !self.supervisor.is_open() {
            return;
        }
        let payload = self.awareness.heartbeat();
        self.send_awareness(&payload).await;
    }

    fn sweep(&mut self) {
        let removed = self.supervisor.sweep_awareness(&mut self.awareness, Instant::now());
        if !removed.is_empty() {
            self.presence.render(&self.awareness, self.binding.widget_mut());
            self.emit(SessionEvent::PresenceChanged);
        }
    }

    // ─── Teardown ────────────────────────────────────────────────

    fn persist(&self) -> Result<u64, SessionError> {
        let bytes = self.doc.export_snapshot()?;
        let revision = self.store.next_revision(&self.document_id)?;
        self.store.save(&self.document_id, revision, &bytes)?;
        info!(
            "Saved {} revision {} ({} bytes)",
            self.document_id,
            revision,
            bytes.len()
        );
        Ok(revision)
    }

    async fn shutdown(&mut self) -> Result<u64, SessionError> {
        if self.supervisor.is_open() {
            let leave = self.awareness.leave_payload();
            self.send_awareness(&leave).await;
        }
        self.transport.close().await;
        self.presence.clear(self.binding.widget_mut());
        self.supervisor.stopped();
        self.persist()
    }

    async fn fatal(&mut self, err: SessionError) -> Flow {
        error!("Session for {} failed: {}", self.document_id, err);
        self.supervisor.fail(err.to_string());
        self.transport.close().await;
        if let Err(e) = self.persist() {
            error!("Failed to save {} after failure: {}", self.document_id, e);
        }
        self.emit(SessionEvent::Fatal(err));
        Flow::Stop
    }
}

// ─── Registry ────────────────────────────────────────────────────

/// Host-owned map of attached documents.
pub struct SessionRegistry {
    sessions: HashMap<String, SessionHandle>,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            store,
            config,
        }
    }

    /// Attach a document. Fails if it is already attached.
    pub async fn attach<W>(&mut self, params: SessionParams, widget: W) -> Result<&mut SessionHandle, SessionError>
    where
        W: EditorWidget + Send + 'static,
    {
        let document_id = params.document_id.clone();
        if self.sessions.contains_key(&document_id) {
            return Err(SessionError::AlreadyAttached(document_id));
        }
        let handle = Session::attach(params, widget, self.store.clone(), self.config.clone()).await?;
        Ok(self.sessions.entry(document_id).or_insert(handle))
    }

    pub fn get(&self, document_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(document_id)
    }

    pub fn get_mut(&mut self, document_id: &str) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(document_id)
    }

    /// Detach one document. Returns the saved revision.
    pub async fn detach(&mut self, document_id: &str) -> Result<u64, SessionError> {
        let handle = self
            .sessions
            .remove(document_id)
            .ok_or_else(|| SessionError::NotAttached(document_id.to_string()))?;
        handle.detach().await
    }

    /// Detach every document, e.g. on host shutdown.
    pub async fn detach_all(&mut self) -> Vec<(String, Result<u64, SessionError>)> {
        let mut results = Vec::with_capacity(self.sessions.len());
        for (document_id, handle) in self.sessions.drain() {
            results.push((document_id, handle.detach().await));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
