//! The consumed data-access seam.
//!
//! The relational schema is out of scope; the engine only needs CRUD over
//! instances, messages, chats, contacts, webhook configuration and the
//! activity log. `MemoryRepository` backs tests and embedders that bring
//! their own persistence.

use crate::socket::{ChatRecord, ContactRecord, MessageRecord, MessageStatusUpdate};
use crate::webhook::WebhookConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Persisted identity and status of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_jid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
    pub connection_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Postmortem row for webhook delivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub instance: String,
    pub event: String,
    pub target_url: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<()>;
    async fn find_instance(&self, name: &str) -> Result<Option<InstanceRecord>>;
    async fn delete_instance(&self, name: &str) -> Result<()>;

    /// Inserts message records, skipping keys already present. Returns how
    /// many were actually inserted.
    async fn insert_messages(&self, instance: &str, records: &[MessageRecord]) -> Result<usize>;
    async fn find_message_by_id(&self, instance: &str, id: &str) -> Result<Option<MessageRecord>>;
    /// All persisted message ids for an instance; used to deduplicate
    /// redelivered history-sync batches.
    async fn message_ids(&self, instance: &str) -> Result<HashSet<String>>;
    async fn insert_message_updates(
        &self,
        instance: &str,
        updates: &[MessageStatusUpdate],
    ) -> Result<usize>;

    async fn find_chat(&self, instance: &str, jid: &str) -> Result<Option<ChatRecord>>;
    async fn insert_chat(&self, instance: &str, chat: &ChatRecord) -> Result<()>;
    async fn delete_chat(&self, instance: &str, jid: &str) -> Result<()>;

    async fn find_contact(&self, instance: &str, jid: &str) -> Result<Option<ContactRecord>>;
    async fn insert_contact(&self, instance: &str, contact: &ContactRecord) -> Result<()>;

    async fn webhook_config(&self, instance: &str) -> Result<Option<WebhookConfig>>;
    /// Applies a partial JSON patch (`url`, `enabled`, `events` object merge)
    /// to the persisted webhook document and returns the merged result.
    async fn merge_webhook_config(&self, instance: &str, patch: &Value) -> Result<WebhookConfig>;

    async fn log_activity(&self, row: &ActivityRow) -> Result<()>;
}

fn scoped(instance: &str, id: &str) -> String {
    format!("{instance}\u{1}{id}")
}

/// In-memory repository keyed by (instance, natural id).
#[derive(Default)]
pub struct MemoryRepository {
    instances: DashMap<String, InstanceRecord>,
    messages: DashMap<String, MessageRecord>,
    message_updates: DashMap<String, Vec<MessageStatusUpdate>>,
    chats: DashMap<String, ChatRecord>,
    contacts: DashMap<String, ContactRecord>,
    webhooks: DashMap<String, WebhookConfig>,
    activity: DashMap<String, Vec<ActivityRow>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_rows(&self, instance: &str) -> Vec<ActivityRow> {
        self.activity
            .get(instance)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn message_count(&self, instance: &str) -> usize {
        let prefix = scoped(instance, "");
        self.messages
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .count()
    }

    pub fn set_webhook_config(&self, instance: &str, config: WebhookConfig) {
        self.webhooks.insert(instance.to_string(), config);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.instances.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn find_instance(&self, name: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.instances.get(name).map(|r| r.clone()))
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.instances.remove(name);
        Ok(())
    }

    async fn insert_messages(&self, instance: &str, records: &[MessageRecord]) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            let key = scoped(instance, &record.key.id);
            if !self.messages.contains_key(&key) {
                self.messages.insert(key, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn find_message_by_id(&self, instance: &str, id: &str) -> Result<Option<MessageRecord>> {
        Ok(self.messages.get(&scoped(instance, id)).map(|m| m.clone()))
    }

    async fn message_ids(&self, instance: &str) -> Result<HashSet<String>> {
        let prefix = scoped(instance, "");
        Ok(self
            .messages
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().key.id.clone())
            .collect())
    }

    async fn insert_message_updates(
        &self,
        instance: &str,
        updates: &[MessageStatusUpdate],
    ) -> Result<usize> {
        self.message_updates
            .entry(instance.to_string())
            .or_default()
            .extend_from_slice(updates);
        Ok(updates.len())
    }

    async fn find_chat(&self, instance: &str, jid: &str) -> Result<Option<ChatRecord>> {
        Ok(self.chats.get(&scoped(instance, jid)).map(|c| c.clone()))
    }

    async fn insert_chat(&self, instance: &str, chat: &ChatRecord) -> Result<()> {
        self.chats.insert(scoped(instance, &chat.id), chat.clone());
        Ok(())
    }

    async fn delete_chat(&self, instance: &str, jid: &str) -> Result<()> {
        self.chats.remove(&scoped(instance, jid));
        Ok(())
    }

    async fn find_contact(&self, instance: &str, jid: &str) -> Result<Option<ContactRecord>> {
        Ok(self.contacts.get(&scoped(instance, jid)).map(|c| c.clone()))
    }

    async fn insert_contact(&self, instance: &str, contact: &ContactRecord) -> Result<()> {
        self.contacts
            .insert(scoped(instance, &contact.id), contact.clone());
        Ok(())
    }

    async fn webhook_config(&self, instance: &str) -> Result<Option<WebhookConfig>> {
        Ok(self.webhooks.get(instance).map(|w| w.clone()))
    }

    async fn merge_webhook_config(&self, instance: &str, patch: &Value) -> Result<WebhookConfig> {
        let mut config = self
            .webhooks
            .get(instance)
            .map(|w| w.clone())
            .unwrap_or_default();
        config.apply_patch(patch);
        self.webhooks.insert(instance.to_string(), config.clone());
        Ok(config)
    }

    async fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.activity
            .entry(row.instance.clone())
            .or_default()
            .push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{DeviceTag, MessageKey};
    use serde_json::json;

    fn message(id: &str, jid: &str) -> MessageRecord {
        MessageRecord {
            key: MessageKey {
                id: id.to_string(),
                remote_jid: jid.to_string(),
                from_me: false,
                participant: None,
            },
            push_name: None,
            message: json!({ "text": "hi" }),
            message_type: "text".to_string(),
            message_timestamp: 1_700_000_000,
            source: DeviceTag::Android,
            quoted: None,
        }
    }

    #[tokio::test]
    async fn messages_are_instance_scoped_and_deduplicated() {
        let repo = MemoryRepository::new();
        let records = vec![
            message("A1", "x@s.whatsapp.net"),
            message("A2", "x@s.whatsapp.net"),
        ];
        assert_eq!(repo.insert_messages("shop1", &records).await.unwrap(), 2);
        // Redelivery inserts nothing.
        assert_eq!(repo.insert_messages("shop1", &records).await.unwrap(), 0);
        // Same ids under another instance are distinct rows.
        assert_eq!(repo.insert_messages("shop2", &records).await.unwrap(), 2);

        let ids = repo.message_ids("shop1").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("A1"));

        assert!(
            repo.find_message_by_id("shop1", "A1")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            repo.find_message_by_id("shop3", "A1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn webhook_patch_merges_partially() {
        let repo = MemoryRepository::new();
        let merged = repo
            .merge_webhook_config(
                "shop1",
                &json!({
                    "url": "https://hooks.example/wa",
                    "enabled": true,
                    "events": { "messages.upsert": true, "call": false }
                }),
            )
            .await
            .unwrap();
        assert_eq!(merged.url.as_deref(), Some("https://hooks.example/wa"));

        // A later patch touching one event key leaves the rest intact.
        let merged = repo
            .merge_webhook_config("shop1", &json!({ "events": { "call": true } }))
            .await
            .unwrap();
        let events = merged.events.unwrap();
        assert_eq!(events.get("messages.upsert"), Some(&true));
        assert_eq!(events.get("call"), Some(&true));
    }
}
