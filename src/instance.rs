//! Per-instance runtime: owns one socket client, its connection state
//! machine, the QR pairing flow, the send pipeline, and the handlers that
//! turn protocol events into persisted records plus dispatched envelopes.

use crate::auth::AuthStateStore;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::hub::RealtimeHub;
use crate::qr;
use crate::registry::RegistrySignal;
use crate::repository::{InstanceRecord, Repository};
use crate::socket::{
    ChatModification, ChatRecord, ContactRecord, DisconnectReason, GroupRecord, MessageKey,
    MessageRecord, MessageStatusUpdate, Presence, SocketClient, SocketEvent, SocketFactory,
    UpsertKind, WireConnection, classify_device, content_type, normalize_message_content,
};
use crate::types::events::{EventEnvelope, EventKind, InstanceDescriptor};
use crate::types::jid::Jid;
use crate::webhook::{WebhookConfig, WebhookDispatcher};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::RngCore;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Duration, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Close,
    Connecting,
    Open,
    Refused,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Close => "close",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Refused => "refused",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    #[serde(rename = "statusReason", skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<u16>,
}

/// Ephemeral pairing state; never persisted beyond process memory.
#[derive(Debug, Clone, Default)]
pub struct QrSession {
    pub count: u32,
    pub code: Option<String>,
    pub base64: Option<String>,
}

/// Options accepted by the send pipeline.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub delay_ms: Option<u64>,
    pub presence: Option<Presence>,
    pub quoted_message_id: Option<String>,
    pub message_id: Option<String>,
}

/// Everything a runtime needs from its environment, injected by the
/// registry so tests can build isolated engines.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub config: Arc<GatewayConfig>,
    pub repository: Arc<dyn Repository>,
    pub auth_store: Arc<dyn AuthStateStore>,
    pub webhook: Arc<WebhookDispatcher>,
    pub hub: Arc<RealtimeHub>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub signals: mpsc::Sender<RegistrySignal>,
}

enum Flow {
    Continue,
    Reconnect,
    Stop,
}

pub struct InstanceRuntime {
    name: String,
    deps: RuntimeDeps,
    socket: Mutex<Option<Arc<dyn SocketClient>>>,
    status: RwLock<ConnectionStatus>,
    qr: Mutex<QrSession>,
    owner_jid: RwLock<Option<String>>,
    profile_pic_url: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
    stopping: AtomicBool,
    is_connecting: AtomicBool,
    reconnect_errors: AtomicU32,
}

impl std::fmt::Debug for InstanceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRuntime")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl InstanceRuntime {
    pub fn new(name: String, deps: RuntimeDeps) -> Arc<Self> {
        Arc::new(Self {
            name,
            deps,
            socket: Mutex::new(None),
            status: RwLock::new(ConnectionStatus {
                state: ConnectionState::Close,
                status_reason: None,
            }),
            qr: Mutex::new(QrSession::default()),
            owner_jid: RwLock::new(None),
            profile_pic_url: RwLock::new(None),
            created_at: Utc::now(),
            stopping: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            reconnect_errors: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    pub async fn qr_session(&self) -> QrSession {
        self.qr.lock().await.clone()
    }

    pub async fn owner_jid(&self) -> Option<String> {
        self.owner_jid.read().await.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    async fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor {
            name: self.name.clone(),
            owner: self.owner_jid.read().await.clone(),
            profile_picture_url: self.profile_pic_url.read().await.clone(),
        }
    }

    async fn socket(&self) -> Option<Arc<dyn SocketClient>> {
        self.socket.lock().await.clone()
    }

    async fn take_socket(&self) -> Option<Arc<dyn SocketClient>> {
        self.socket.lock().await.take()
    }

    // ---- connection lifecycle -------------------------------------------

    /// Creates the socket and starts the event loop. The connection state
    /// itself only moves on `connection.update` events from the adapter.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.stopping.load(Ordering::Relaxed) {
            return Err(GatewayError::BadRequest(format!(
                "instance \"{}\" is being removed",
                self.name
            )));
        }
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::BadRequest(format!(
                "instance \"{}\" is already connecting",
                self.name
            )));
        }
        let _connecting = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        // A live socket means the event loop is already running; a second
        // loop would break sequential event processing.
        if self.socket.lock().await.is_some() {
            return Err(GatewayError::BadRequest(format!(
                "instance \"{}\" is already connected",
                self.name
            )));
        }
        let rx = self.create_socket().await.map_err(GatewayError::Internal)?;

        self.dispatch(
            EventKind::StatusInstance,
            json!({ "instance": self.name, "status": "created" }),
        )
        .await;

        let runtime = self.clone();
        tokio::spawn(async move { runtime.event_loop(rx).await });
        Ok(())
    }

    async fn create_socket(&self) -> anyhow::Result<mpsc::Receiver<SocketEvent>> {
        let creds = match self.deps.auth_store.read(&self.name).await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(target: "Instance/Connection", "[{}] failed to load auth state: {e}", self.name);
                None
            }
        };
        let (socket, rx) = self.deps.socket_factory.create(&self.name, creds).await?;
        *self.socket.lock().await = Some(socket);
        Ok(rx)
    }

    /// Sequentially drains the adapter's event stream. All protocol events
    /// for this instance are processed in arrival order; reconnection swaps
    /// in a fresh stream without ever running two loops concurrently.
    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<SocketEvent>) {
        loop {
            let flow = match rx.recv().await {
                Some(event) => self.handle_event(event).await,
                None if self.stopping.load(Ordering::Relaxed) => Flow::Stop,
                None => {
                    warn!(target: "Instance/Connection", "[{}] event stream ended unexpectedly", self.name);
                    Flow::Reconnect
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Reconnect => match self.reconnect().await {
                    Some(new_rx) => rx = new_rx,
                    None => break,
                },
                Flow::Stop => break,
            }
        }
        debug!(target: "Instance/Connection", "[{}] event loop shut down", self.name);
    }

    /// One reconnect per disconnect, retrying socket creation with the same
    /// capped backoff the disconnects use. Returns `None` when the instance
    /// is being torn down.
    async fn reconnect(&self) -> Option<mpsc::Receiver<SocketEvent>> {
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return None;
            }
            let errors = self.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_secs(u64::from(errors * 2).min(30));
            info!(
                target: "Instance/Connection",
                "[{}] reconnecting in {:?} (attempt {})", self.name, delay, errors + 1
            );
            sleep(delay).await;
            match self.create_socket().await {
                Ok(rx) => return Some(rx),
                Err(e) => {
                    error!(target: "Instance/Connection", "[{}] reconnect failed: {e}", self.name);
                }
            }
        }
    }

    async fn handle_event(&self, event: SocketEvent) -> Flow {
        match event {
            SocketEvent::ConnectionUpdate {
                connection,
                qr,
                status_code,
            } => self.handle_connection_update(connection, qr, status_code).await,
            SocketEvent::CredsUpdate(creds) => {
                if let Err(e) = self.deps.auth_store.write(&self.name, &creds).await {
                    warn!(target: "Instance/Connection", "[{}] failed to persist creds: {e}", self.name);
                }
                Flow::Continue
            }
            SocketEvent::MessagingHistorySet {
                chats,
                contacts,
                messages,
            } => {
                self.handle_history_set(chats, contacts, messages).await;
                Flow::Continue
            }
            SocketEvent::MessagesUpsert { messages, kind } => {
                self.handle_messages_upsert(messages, kind).await;
                Flow::Continue
            }
            SocketEvent::MessagesUpdate(updates) => {
                self.handle_messages_update(updates).await;
                Flow::Continue
            }
            SocketEvent::ChatsUpsert(chats) => {
                let records = self.upsert_chats(&chats).await;
                self.dispatch(EventKind::ChatsUpsert, json!(records)).await;
                Flow::Continue
            }
            SocketEvent::ChatsUpdate(chats) => {
                let records = self.upsert_chats(&chats).await;
                self.dispatch(EventKind::ChatsUpdate, json!(records)).await;
                Flow::Continue
            }
            SocketEvent::ChatsDelete(jids) => {
                for jid in &jids {
                    if let Err(e) = self.deps.repository.delete_chat(&self.name, jid).await {
                        warn!(target: "Instance/Events", "[{}] chat delete failed: {e}", self.name);
                    }
                }
                self.dispatch(EventKind::ChatsDelete, json!(jids)).await;
                Flow::Continue
            }
            SocketEvent::ContactsUpsert(contacts) => {
                let records = self.upsert_contacts(&contacts).await;
                self.dispatch(EventKind::ContactsUpsert, json!(records)).await;
                Flow::Continue
            }
            SocketEvent::ContactsUpdate(contacts) => {
                let records = self.upsert_contacts(&contacts).await;
                self.dispatch(EventKind::ContactsUpdate, json!(records)).await;
                Flow::Continue
            }
            SocketEvent::GroupsUpsert(groups) => {
                self.dispatch(EventKind::GroupsUpsert, json!(groups)).await;
                Flow::Continue
            }
            SocketEvent::GroupsUpdate(groups) => {
                self.dispatch(EventKind::GroupsUpdate, json!(groups)).await;
                Flow::Continue
            }
            SocketEvent::GroupParticipantsUpdate {
                group_jid,
                participants,
                action,
            } => {
                self.dispatch(
                    EventKind::GroupParticipantsUpdate,
                    json!({ "id": group_jid, "participants": participants, "action": action }),
                )
                .await;
                Flow::Continue
            }
            SocketEvent::PresenceUpdate(presence) => {
                self.dispatch(EventKind::PresenceUpdate, json!(presence)).await;
                Flow::Continue
            }
            SocketEvent::Call(call) => {
                self.dispatch(EventKind::Call, json!(call)).await;
                Flow::Continue
            }
            SocketEvent::LabelsEdit(label) => {
                self.dispatch(EventKind::LabelsEdit, json!(label)).await;
                Flow::Continue
            }
            SocketEvent::LabelsAssociation { association, kind } => {
                self.dispatch(
                    EventKind::LabelsAssociation,
                    json!({ "association": association, "type": kind }),
                )
                .await;
                Flow::Continue
            }
        }
    }

    async fn handle_connection_update(
        &self,
        connection: Option<WireConnection>,
        qr: Option<String>,
        status_code: Option<u16>,
    ) -> Flow {
        if let Some(code) = qr
            && self.handle_qr_challenge(&code).await
        {
            return Flow::Stop;
        }
        match connection {
            Some(WireConnection::Connecting) => {
                self.set_state(ConnectionState::Connecting, status_code).await;
                Flow::Continue
            }
            Some(WireConnection::Open) => {
                self.handle_open().await;
                Flow::Continue
            }
            Some(WireConnection::Close) => self.handle_close(status_code).await,
            None => Flow::Continue,
        }
    }

    /// Returns true when the pairing limit was breached and the instance
    /// must be torn down.
    async fn handle_qr_challenge(&self, code: &str) -> bool {
        if self.stopping.load(Ordering::Relaxed)
            || self.status.read().await.state == ConnectionState::Refused
        {
            return true;
        }

        let count = {
            let mut session = self.qr.lock().await;
            session.count += 1;
            session.count
        };

        if count >= self.deps.config.qr_limit {
            warn!(
                target: "Instance/Pairing",
                "[{}] QR limit of {} reached, refusing connection", self.name, self.deps.config.qr_limit
            );
            self.dispatch(
                EventKind::QrcodeUpdated,
                json!({ "message": "QR code limit reached, pairing refused", "count": count }),
            )
            .await;
            self.set_state(
                ConnectionState::Refused,
                Some(DisconnectReason::CONNECTION_CLOSED.code()),
            )
            .await;
            self.dispatch(
                EventKind::StatusInstance,
                json!({ "instance": self.name, "status": "removed" }),
            )
            .await;
            self.stopping.store(true, Ordering::Relaxed);
            self.signal(RegistrySignal::NoConnection(self.name.clone())).await;
            if let Some(socket) = self.take_socket().await {
                socket.end().await;
            }
            return true;
        }

        match qr::render(code) {
            Ok(rendering) => {
                {
                    let mut session = self.qr.lock().await;
                    session.code = Some(rendering.code.clone());
                    session.base64 = Some(rendering.base64.clone());
                }
                self.dispatch(EventKind::QrcodeUpdated, json!({ "qrcode": rendering })).await;
            }
            Err(e) => {
                warn!(target: "Instance/Pairing", "[{}] QR rendering failed: {e}", self.name);
                self.dispatch(EventKind::QrcodeUpdated, json!({ "qrcode": { "code": code } }))
                    .await;
            }
        }
        if let Some(terminal) = qr::render_terminal(code) {
            info!(target: "Instance/Pairing", "[{}] scan to pair:\n{terminal}", self.name);
        }
        false
    }

    async fn handle_open(&self) {
        self.reconnect_errors.store(0, Ordering::Relaxed);
        {
            let mut session = self.qr.lock().await;
            *session = QrSession::default();
        }

        // Owner identity comes from the pairing credentials the adapter
        // keeps fresh through creds.update.
        let owner = match self.deps.auth_store.read(&self.name).await {
            Ok(creds) => creds.and_then(|c| c.me),
            Err(e) => {
                warn!(target: "Instance/Connection", "[{}] failed to read owner identity: {e}", self.name);
                None
            }
        };
        if let Some(owner) = owner {
            if let Ok(jid) = owner.parse::<Jid>()
                && let Some(socket) = self.socket().await
            {
                match socket.profile_picture_url(&jid.to_non_ad()).await {
                    Ok(url) => *self.profile_pic_url.write().await = url,
                    Err(e) => {
                        debug!(target: "Instance/Connection", "[{}] profile picture fetch failed: {e}", self.name);
                    }
                }
            }
            *self.owner_jid.write().await = Some(owner);
        }

        self.set_state(ConnectionState::Open, Some(200)).await;
    }

    async fn handle_close(&self, status_code: Option<u16>) -> Flow {
        self.set_state(ConnectionState::Close, status_code).await;

        let logged_out = status_code
            .map(|code| DisconnectReason(code).is_logged_out())
            .unwrap_or(false);
        if logged_out {
            info!(target: "Instance/Connection", "[{}] logged out, tearing down", self.name);
            self.dispatch(
                EventKind::StatusInstance,
                json!({ "instance": self.name, "status": "removed" }),
            )
            .await;
            self.stopping.store(true, Ordering::Relaxed);
            self.signal(RegistrySignal::RemoveInstance(self.name.clone())).await;
            if let Some(socket) = self.take_socket().await {
                socket.end().await;
            }
            return Flow::Stop;
        }
        if self.stopping.load(Ordering::Relaxed) {
            return Flow::Stop;
        }
        info!(
            target: "Instance/Connection",
            "[{}] connection closed (reason {:?}), will reconnect", self.name, status_code
        );
        Flow::Reconnect
    }

    /// Applies a state transition, persists the instance record
    /// (best-effort) and unconditionally dispatches `connection.update`.
    async fn set_state(&self, state: ConnectionState, status_reason: Option<u16>) {
        let status = {
            let mut current = self.status.write().await;
            current.state = state;
            current.status_reason = status_reason;
            current.clone()
        };
        self.persist_instance(&status).await;
        match serde_json::to_value(&status) {
            Ok(data) => self.dispatch(EventKind::ConnectionUpdate, data).await,
            Err(e) => {
                warn!(target: "Instance/Connection", "[{}] failed to serialize status: {e}", self.name);
            }
        }
    }

    async fn persist_instance(&self, status: &ConnectionStatus) {
        let record = InstanceRecord {
            name: self.name.clone(),
            owner_jid: self.owner_jid.read().await.clone(),
            profile_pic_url: self.profile_pic_url.read().await.clone(),
            connection_status: status.state.as_str().to_string(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.deps.repository.upsert_instance(&record).await {
            warn!(target: "Instance/Connection", "[{}] instance persistence failed: {e}", self.name);
        }
    }

    async fn signal(&self, signal: RegistrySignal) {
        if self.deps.signals.send(signal).await.is_err() {
            warn!(target: "Instance/Connection", "[{}] registry signal channel is closed", self.name);
        }
    }

    /// Pushes `data` raw over the hub and POSTs the enveloped form to the
    /// configured webhooks. Used by every event handler; never fails.
    async fn dispatch(&self, event: EventKind, data: Value) {
        self.deps.hub.send(&self.name, event, &data);
        let envelope = EventEnvelope {
            event,
            instance: self.descriptor().await,
            data,
        };
        self.deps.webhook.dispatch(&envelope).await;
    }

    // ---- event handlers --------------------------------------------------

    async fn handle_messages_upsert(&self, messages: Vec<MessageRecord>, kind: UpsertKind) {
        let mut records = Vec::with_capacity(messages.len());
        for mut record in messages {
            record.message = normalize_message_content(record.message);
            record.message_type = content_type(&record.message);
            records.push(record);
        }
        if kind == UpsertKind::Notify
            && self.deps.config.store_new_message
            && let Err(e) = self.deps.repository.insert_messages(&self.name, &records).await
        {
            warn!(target: "Instance/Events", "[{}] message persistence failed: {e}", self.name);
        }
        for record in &records {
            match serde_json::to_value(record) {
                Ok(data) => self.dispatch(EventKind::MessagesUpsert, data).await,
                Err(e) => {
                    warn!(target: "Instance/Events", "[{}] message serialization failed: {e}", self.name);
                }
            }
        }
    }

    async fn handle_messages_update(&self, updates: Vec<MessageStatusUpdate>) {
        if self.deps.config.store_message_update
            && let Err(e) = self
                .deps
                .repository
                .insert_message_updates(&self.name, &updates)
                .await
        {
            warn!(target: "Instance/Events", "[{}] status-update persistence failed: {e}", self.name);
        }
        for update in &updates {
            match serde_json::to_value(update) {
                Ok(data) => self.dispatch(EventKind::MessagesUpdate, data).await,
                Err(e) => {
                    warn!(target: "Instance/Events", "[{}] update serialization failed: {e}", self.name);
                }
            }
        }
    }

    /// History batches can be redelivered by the protocol layer; only keys
    /// never seen before are inserted.
    async fn handle_history_set(
        &self,
        chats: Vec<ChatRecord>,
        contacts: Vec<ContactRecord>,
        messages: Vec<MessageRecord>,
    ) {
        let known = match self.deps.repository.message_ids(&self.name).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(target: "Instance/Events", "[{}] message-id lookup failed: {e}", self.name);
                Default::default()
            }
        };
        let fresh: Vec<MessageRecord> = messages
            .into_iter()
            .filter(|m| !known.contains(&m.key.id))
            .map(|mut record| {
                record.message = normalize_message_content(record.message);
                record.message_type = content_type(&record.message);
                record
            })
            .collect();

        if self.deps.config.store_new_message
            && !fresh.is_empty()
            && let Err(e) = self.deps.repository.insert_messages(&self.name, &fresh).await
        {
            warn!(target: "Instance/Events", "[{}] history persistence failed: {e}", self.name);
        }

        let chat_records = self.upsert_chats(&chats).await;
        let contact_records = self.upsert_contacts(&contacts).await;

        self.dispatch(EventKind::ChatsSet, json!(chat_records)).await;
        self.dispatch(EventKind::ContactsSet, json!(contact_records)).await;
        self.dispatch(EventKind::MessagesSet, json!(fresh)).await;
    }

    /// Idempotent upsert keyed by (remote JID, instance): an existing
    /// record is reused, a missing one created.
    async fn upsert_chats(&self, chats: &[ChatRecord]) -> Vec<ChatRecord> {
        let mut records = Vec::with_capacity(chats.len());
        for chat in chats {
            match self.deps.repository.find_chat(&self.name, &chat.id).await {
                Ok(Some(existing)) => records.push(existing),
                Ok(None) => {
                    if self.deps.config.store_chats
                        && let Err(e) = self.deps.repository.insert_chat(&self.name, chat).await
                    {
                        warn!(target: "Instance/Events", "[{}] chat persistence failed: {e}", self.name);
                    }
                    records.push(chat.clone());
                }
                Err(e) => {
                    warn!(target: "Instance/Events", "[{}] chat lookup failed: {e}", self.name);
                    records.push(chat.clone());
                }
            }
        }
        records
    }

    async fn upsert_contacts(&self, contacts: &[ContactRecord]) -> Vec<ContactRecord> {
        let mut records = Vec::with_capacity(contacts.len());
        for contact in contacts {
            match self.deps.repository.find_contact(&self.name, &contact.id).await {
                Ok(Some(existing)) => records.push(existing),
                Ok(None) => {
                    if self.deps.config.store_contacts
                        && let Err(e) = self.deps.repository.insert_contact(&self.name, contact).await
                    {
                        warn!(target: "Instance/Events", "[{}] contact persistence failed: {e}", self.name);
                    }
                    records.push(contact.clone());
                }
                Err(e) => {
                    warn!(target: "Instance/Events", "[{}] contact lookup failed: {e}", self.name);
                    records.push(contact.clone());
                }
            }
        }
        records
    }

    // ---- outbound send pipeline -----------------------------------------

    /// Resolves the recipient, verifies it exists on the network, simulates
    /// presence if asked, relays the locally assembled envelope and re-emits
    /// the synthesized record through the inbound upsert handler so
    /// persistence/webhook/push logic is not duplicated.
    pub async fn send_message(
        &self,
        number: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<MessageRecord> {
        if self.status.read().await.state != ConnectionState::Open {
            return Err(GatewayError::NotConnected(self.name.clone()));
        }
        let socket = self
            .socket()
            .await
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;

        let jid = Jid::canonicalize_number(number)
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

        if jid.is_group() {
            socket
                .group_metadata(&jid)
                .await
                .map_err(|e| GatewayError::NotFound(format!("group {jid} not found: {e}")))?;
        } else if !jid.is_broadcast() {
            let exists = socket
                .on_whatsapp(&jid)
                .await
                .map_err(GatewayError::Internal)?;
            if !exists {
                return Err(GatewayError::BadRequest(format!(
                    "recipient {jid} does not exist on whatsapp"
                )));
            }
        }

        let quoted = match &options.quoted_message_id {
            Some(id) => {
                if !self.deps.config.store_new_message {
                    return Err(GatewayError::BadRequest(
                        "quoting requires message persistence, which is disabled".to_string(),
                    ));
                }
                let record = self
                    .deps
                    .repository
                    .find_message_by_id(&self.name, id)
                    .await
                    .map_err(GatewayError::Internal)?
                    .ok_or_else(|| {
                        GatewayError::BadRequest(format!("quoted message {id} not found"))
                    })?;
                Some(record)
            }
            None => None,
        };

        if let Some(delay) = options.delay_ms {
            let indicator = options.presence.unwrap_or(Presence::Composing);
            socket
                .presence_subscribe(&jid)
                .await
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            socket
                .send_presence_update(&jid, indicator)
                .await
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            sleep(Duration::from_millis(delay)).await;
            socket
                .send_presence_update(&jid, Presence::Paused)
                .await
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        }

        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(generate_message_id);

        // Envelope assembly is local; the only network round-trip is the
        // relay itself.
        let mut outgoing = normalize_message_content(content);
        if let Some(quoted) = &quoted {
            outgoing["contextInfo"] = json!({
                "stanzaId": quoted.key.id,
                "participant": quoted
                    .key
                    .participant
                    .clone()
                    .unwrap_or_else(|| quoted.key.remote_jid.clone()),
                "quotedMessage": quoted.message,
            });
        }

        let network_id = socket
            .relay_message(&jid, &outgoing, &message_id)
            .await
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

        let message_type = content_type(&outgoing);
        let record = MessageRecord {
            key: MessageKey {
                id: network_id,
                remote_jid: jid.to_string(),
                from_me: true,
                participant: None,
            },
            push_name: None,
            message: outgoing,
            message_type,
            message_timestamp: Utc::now().timestamp(),
            source: classify_device(&message_id),
            quoted: quoted.map(|q| q.key),
        };

        self.handle_messages_upsert(vec![record.clone()], UpsertKind::Notify)
            .await;
        Ok(record)
    }

    // ---- registry-facing operations -------------------------------------

    /// Explicit logout: best-effort server-side logout, then teardown
    /// signalling. Cleanup failures are logged, never re-thrown.
    pub async fn logout(&self) -> Result<()> {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(socket) = self.socket().await
            && let Err(e) = socket.logout().await
        {
            warn!(target: "Instance/Connection", "[{}] logout call failed: {e}", self.name);
        }
        self.dispatch(
            EventKind::StatusInstance,
            json!({ "instance": self.name, "status": "removed" }),
        )
        .await;
        self.set_state(
            ConnectionState::Close,
            Some(DisconnectReason::LOGGED_OUT.code()),
        )
        .await;
        if let Some(socket) = self.take_socket().await {
            socket.end().await;
        }
        self.signal(RegistrySignal::RemoveInstance(self.name.clone())).await;
        Ok(())
    }

    /// Closes the socket without logging out; pairing survives.
    pub async fn close(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(socket) = self.take_socket().await {
            socket.end().await;
        }
    }

    pub async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        let socket = self
            .socket()
            .await
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;
        socket
            .read_messages(keys)
            .await
            .map_err(|e| GatewayError::BadRequest(e.to_string()))
    }

    pub async fn chat_modify(&self, jid: &str, modification: ChatModification) -> Result<()> {
        let socket = self
            .socket()
            .await
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;
        let jid = Jid::canonicalize_number(jid)
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        socket
            .chat_modify(&jid, modification)
            .await
            .map_err(|e| GatewayError::BadRequest(e.to_string()))
    }

    pub async fn group_metadata(&self, jid: &str) -> Result<GroupRecord> {
        let socket = self
            .socket()
            .await
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;
        let jid: Jid = jid
            .parse()
            .map_err(|e: crate::types::jid::JidError| GatewayError::BadRequest(e.to_string()))?;
        socket
            .group_metadata(&jid)
            .await
            .map_err(|e| GatewayError::NotFound(format!("group {jid} not found: {e}")))
    }

    /// Partial update of the persisted webhook configuration.
    pub async fn update_webhook(&self, patch: &Value) -> Result<WebhookConfig> {
        self.deps
            .repository
            .merge_webhook_config(&self.name, patch)
            .await
            .map_err(GatewayError::Internal)
    }

    pub async fn webhook_config(&self) -> Result<Option<WebhookConfig>> {
        self.deps
            .repository
            .webhook_config(&self.name)
            .await
            .map_err(GatewayError::Internal)
    }
}

/// Locally generated ids use the web-client shape: `3EB0` + 18 hex chars.
fn generate_message_id() -> String {
    let mut bytes = [0u8; 9];
    rand::rng().fill_bytes(&mut bytes);
    format!("3EB0{}", hex::encode_upper(bytes))
}
