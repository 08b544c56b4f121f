//! The consumed protocol-adapter seam.
//!
//! The gateway never speaks the WhatsApp wire protocol itself; it drives an
//! opaque, already-authenticated socket client through these traits and
//! consumes its event stream. A concrete adapter (the protocol library)
//! lives outside this crate; tests script the seam directly.

use crate::types::jid::Jid;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection value carried by `connection.update` protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireConnection {
    Connecting,
    Open,
    Close,
}

/// Numeric disconnect reasons mirrored from the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReason(pub u16);

impl DisconnectReason {
    pub const CONNECTION_LOST: DisconnectReason = DisconnectReason(408);
    pub const CONNECTION_CLOSED: DisconnectReason = DisconnectReason(428);
    pub const CONNECTION_REPLACED: DisconnectReason = DisconnectReason(440);
    pub const LOGGED_OUT: DisconnectReason = DisconnectReason(401);
    pub const BAD_SESSION: DisconnectReason = DisconnectReason(500);
    pub const RESTART_REQUIRED: DisconnectReason = DisconnectReason(515);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Explicit logout is the one disconnect the runtime never recovers from.
    pub fn is_logged_out(&self) -> bool {
        self.0 == Self::LOGGED_OUT.0
    }
}

/// Which physical device produced a message, classified from the shape of
/// its message id the way WhatsApp clients generate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTag {
    Ios,
    Web,
    Android,
    Desktop,
    Unknown,
}

pub fn classify_device(message_id: &str) -> DeviceTag {
    let len = message_id.len();
    if message_id.starts_with("3A") && len == 20 {
        DeviceTag::Ios
    } else if message_id.starts_with("3E") && len == 22 {
        DeviceTag::Web
    } else if len == 21 || len == 32 {
        DeviceTag::Android
    } else if message_id.starts_with("3F") || len == 18 {
        DeviceTag::Desktop
    } else {
        DeviceTag::Unknown
    }
}

/// Natural identity of a message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    pub id: String,
    #[serde(rename = "remoteJid")]
    pub remote_jid: String,
    #[serde(rename = "fromMe")]
    pub from_me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// One persisted/forwarded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key: MessageKey,
    #[serde(rename = "pushName", skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    pub message: Value,
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: i64,
    pub source: DeviceTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted: Option<MessageKey>,
}

/// Delivery-status change for an already-relayed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusUpdate {
    pub key: MessageKey,
    pub status: String,
    #[serde(rename = "datetime")]
    pub datetime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    #[serde(rename = "pushName", skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(rename = "profilePictureUrl", skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: String,
    pub presences: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub from: String,
    pub status: String,
    #[serde(rename = "isVideo", default)]
    pub is_video: bool,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: String,
    pub name: String,
    pub color: u32,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelAssociation {
    #[serde(rename = "labelId")]
    pub label_id: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAssociationKind {
    Add,
    Remove,
}

/// Whether a `messages.upsert` batch is fresh traffic or backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Pairing credentials and signal keys, persisted per instance. The inner
/// key material is opaque to the gateway; only the owner JID is inspected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthCreds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    #[serde(default)]
    pub keys: Value,
}

/// Presence indicators the send pipeline can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

/// Chat-state mutations forwarded to the protocol layer.
#[derive(Debug, Clone)]
pub enum ChatModification {
    Archive(bool),
    MarkRead(bool),
    Mute(Option<i64>),
    Delete,
}

/// Discrete protocol event stream, one variant per event category.
///
/// The reference implementation dispatched these through dynamic
/// string-keyed handler maps; the closed enum keeps every consumer
/// exhaustiveness-checked.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    ConnectionUpdate {
        connection: Option<WireConnection>,
        qr: Option<String>,
        status_code: Option<u16>,
    },
    CredsUpdate(AuthCreds),
    MessagingHistorySet {
        chats: Vec<ChatRecord>,
        contacts: Vec<ContactRecord>,
        messages: Vec<MessageRecord>,
    },
    MessagesUpsert {
        messages: Vec<MessageRecord>,
        kind: UpsertKind,
    },
    MessagesUpdate(Vec<MessageStatusUpdate>),
    ChatsUpsert(Vec<ChatRecord>),
    ChatsUpdate(Vec<ChatRecord>),
    ChatsDelete(Vec<String>),
    ContactsUpsert(Vec<ContactRecord>),
    ContactsUpdate(Vec<ContactRecord>),
    GroupsUpsert(Vec<GroupRecord>),
    GroupsUpdate(Vec<GroupRecord>),
    GroupParticipantsUpdate {
        group_jid: String,
        participants: Vec<String>,
        action: ParticipantAction,
    },
    PresenceUpdate(PresenceRecord),
    Call(CallRecord),
    LabelsEdit(LabelRecord),
    LabelsAssociation {
        association: LabelAssociation,
        kind: LabelAssociationKind,
    },
}

/// Handle to one authenticated WhatsApp session.
#[async_trait]
pub trait SocketClient: Send + Sync {
    /// Relays an already-assembled message envelope; returns the
    /// network-assigned message id.
    async fn relay_message(
        &self,
        jid: &Jid,
        content: &Value,
        message_id: &str,
    ) -> anyhow::Result<String>;

    async fn send_presence_update(&self, jid: &Jid, presence: Presence) -> anyhow::Result<()>;

    async fn presence_subscribe(&self, jid: &Jid) -> anyhow::Result<()>;

    async fn profile_picture_url(&self, jid: &Jid) -> anyhow::Result<Option<String>>;

    /// Whether the given user JID is registered on the network.
    async fn on_whatsapp(&self, jid: &Jid) -> anyhow::Result<bool>;

    async fn group_metadata(&self, jid: &Jid) -> anyhow::Result<GroupRecord>;

    async fn read_messages(&self, keys: &[MessageKey]) -> anyhow::Result<()>;

    async fn chat_modify(&self, jid: &Jid, modification: ChatModification) -> anyhow::Result<()>;

    /// Server-side logout; invalidates the pairing.
    async fn logout(&self) -> anyhow::Result<()>;

    /// Closes the connection without logging out.
    async fn end(&self);
}

/// Creates connected socket clients. Each call yields a fresh session handle
/// plus its event stream; reconnection is a new `create` call.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create(
        &self,
        instance: &str,
        creds: Option<AuthCreds>,
    ) -> anyhow::Result<(Arc<dyn SocketClient>, mpsc::Receiver<SocketEvent>)>;
}

/// Collapses known enveloping subtypes (ephemeral / view-once / document
/// with caption) to their inner payload and normalizes stringly-typed text
/// to an object-shaped `{"text": ...}` payload, so downstream consumers see
/// one shape regardless of which client wrapper produced the message.
pub fn normalize_message_content(content: Value) -> Value {
    let mut current = content;
    loop {
        if let Value::String(text) = current {
            return serde_json::json!({ "text": text });
        }
        let inner = ["ephemeralMessage", "viewOnceMessage", "viewOnceMessageV2", "documentWithCaptionMessage"]
            .iter()
            .find_map(|wrapper| {
                current
                    .get(wrapper)
                    .and_then(|w| w.get("message"))
                    .cloned()
            });
        match inner {
            Some(unwrapped) => current = unwrapped,
            None => {
                if let Some(text) = current.get("conversation").and_then(Value::as_str) {
                    return serde_json::json!({ "text": text });
                }
                return current;
            }
        }
    }
}

/// Content-type classification: the first content-bearing key of the
/// normalized payload names the message type. `messageContextInfo` is
/// metadata, not content.
pub fn content_type(content: &Value) -> String {
    content
        .as_object()
        .and_then(|map| map.keys().find(|k| *k != "messageContextInfo"))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}
