use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed catalogue of the event names the gateway fans out.
///
/// The reference system dispatched on per-event-name object literals; here
/// the set is a plain enum so every dispatch site is exhaustiveness-checked
/// and the realtime-hub allowlist falls out of `ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "qrcode.updated")]
    QrcodeUpdated,
    #[serde(rename = "connection.update")]
    ConnectionUpdate,
    #[serde(rename = "status.instance")]
    StatusInstance,
    #[serde(rename = "messages.set")]
    MessagesSet,
    #[serde(rename = "messages.upsert")]
    MessagesUpsert,
    #[serde(rename = "messages.update")]
    MessagesUpdate,
    #[serde(rename = "chats.set")]
    ChatsSet,
    #[serde(rename = "chats.upsert")]
    ChatsUpsert,
    #[serde(rename = "chats.update")]
    ChatsUpdate,
    #[serde(rename = "chats.delete")]
    ChatsDelete,
    #[serde(rename = "contacts.set")]
    ContactsSet,
    #[serde(rename = "contacts.upsert")]
    ContactsUpsert,
    #[serde(rename = "contacts.update")]
    ContactsUpdate,
    #[serde(rename = "groups.upsert")]
    GroupsUpsert,
    #[serde(rename = "groups.update")]
    GroupsUpdate,
    #[serde(rename = "group-participants.update")]
    GroupParticipantsUpdate,
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    #[serde(rename = "call")]
    Call,
    #[serde(rename = "labels.edit")]
    LabelsEdit,
    #[serde(rename = "labels.association")]
    LabelsAssociation,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::QrcodeUpdated,
        EventKind::ConnectionUpdate,
        EventKind::StatusInstance,
        EventKind::MessagesSet,
        EventKind::MessagesUpsert,
        EventKind::MessagesUpdate,
        EventKind::ChatsSet,
        EventKind::ChatsUpsert,
        EventKind::ChatsUpdate,
        EventKind::ChatsDelete,
        EventKind::ContactsSet,
        EventKind::ContactsUpsert,
        EventKind::ContactsUpdate,
        EventKind::GroupsUpsert,
        EventKind::GroupsUpdate,
        EventKind::GroupParticipantsUpdate,
        EventKind::PresenceUpdate,
        EventKind::Call,
        EventKind::LabelsEdit,
        EventKind::LabelsAssociation,
    ];

    /// The dotted wire name used in webhook envelopes and hub subscriptions.
    pub fn as_dotted(&self) -> &'static str {
        match self {
            EventKind::QrcodeUpdated => "qrcode.updated",
            EventKind::ConnectionUpdate => "connection.update",
            EventKind::StatusInstance => "status.instance",
            EventKind::MessagesSet => "messages.set",
            EventKind::MessagesUpsert => "messages.upsert",
            EventKind::MessagesUpdate => "messages.update",
            EventKind::ChatsSet => "chats.set",
            EventKind::ChatsUpsert => "chats.upsert",
            EventKind::ChatsUpdate => "chats.update",
            EventKind::ChatsDelete => "chats.delete",
            EventKind::ContactsSet => "contacts.set",
            EventKind::ContactsUpsert => "contacts.upsert",
            EventKind::ContactsUpdate => "contacts.update",
            EventKind::GroupsUpsert => "groups.upsert",
            EventKind::GroupsUpdate => "groups.update",
            EventKind::GroupParticipantsUpdate => "group-participants.update",
            EventKind::PresenceUpdate => "presence.update",
            EventKind::Call => "call",
            EventKind::LabelsEdit => "labels.edit",
            EventKind::LabelsAssociation => "labels.association",
        }
    }

    pub fn from_dotted(name: &str) -> Option<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_dotted() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_dotted())
    }
}

/// Instance identity as seen by webhook/websocket consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(rename = "instanceName")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "profilePictureUrl", skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

/// The JSON body POSTed to webhook targets and pushed over the hub.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event: EventKind,
    pub instance: InstanceDescriptor,
    pub data: serde_json::Value,
}
