//! Best-effort webhook delivery.
//!
//! Every event envelope is attempted against at most two targets: the
//! instance's own webhook (if enabled and the event passes its flag policy)
//! and the globally configured webhook (if enabled and its URL is valid).
//! The two deliveries are independent; failures are logged, optionally
//! recorded as activity-log rows, and never propagated to the caller.

use crate::config::{GatewayConfig, GlobalWebhook};
use crate::repository::{ActivityRow, Repository};
use crate::types::events::{EventEnvelope, EventKind};
use anyhow::anyhow;
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use ureq::Agent;

/// Per-instance webhook configuration, persisted via the repository.
///
/// Event-flag policy — easy to invert by mistake, so spelled out: when
/// `events` is `None` every event is delivered (permissive default); when
/// the map is present an event is delivered only if its flag is explicitly
/// `true`. An explicit `false` and a missing key both suppress delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<BTreeMap<String, bool>>,
}

impl WebhookConfig {
    pub fn allows(&self, event: EventKind) -> bool {
        match &self.events {
            None => true,
            Some(map) => map.get(event.as_dotted()).copied() == Some(true),
        }
    }

    /// Partial JSON-patch merge: `url` and `enabled` replace when present,
    /// `events` merges per key (`null` removes a key).
    pub fn apply_patch(&mut self, patch: &Value) {
        if let Some(url) = patch.get("url").and_then(Value::as_str) {
            self.url = Some(url.to_string());
        }
        if let Some(enabled) = patch.get("enabled").and_then(Value::as_bool) {
            self.enabled = enabled;
        }
        if let Some(events) = patch.get("events").and_then(Value::as_object) {
            let map = self.events.get_or_insert_with(BTreeMap::new);
            for (key, value) in events {
                match value {
                    Value::Null => {
                        map.remove(key);
                    }
                    Value::Bool(flag) => {
                        map.insert(key.clone(), *flag);
                    }
                    _ => {}
                }
            }
        }
    }
}

pub struct WebhookDispatcher {
    agent: Agent,
    repository: Arc<dyn Repository>,
    global: Option<GlobalWebhook>,
    log_failures: bool,
}

impl WebhookDispatcher {
    pub fn new(config: &GatewayConfig, repository: Arc<dyn Repository>) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(config.webhook_timeout))
            .build()
            .new_agent();
        Self {
            agent,
            repository,
            global: config.global_webhook.clone(),
            log_failures: config.log_webhook_failures,
        }
    }

    /// Delivers the envelope to the per-instance and global targets. Never
    /// fails: the triggering protocol event must not block on delivery.
    pub async fn dispatch(&self, envelope: &EventEnvelope) {
        let body = match serde_json::to_vec(envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(target: "Webhook", "Failed to serialize envelope for {}: {e}", envelope.event);
                return;
            }
        };

        let instance = envelope.instance.name.clone();
        let owner = envelope.instance.owner.clone();

        match self.repository.webhook_config(&instance).await {
            Ok(Some(local)) if local.enabled && local.allows(envelope.event) => {
                if let Some(url) = local.url.clone() {
                    self.deliver(&instance, envelope.event, url, body.clone(), owner.clone())
                        .await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "Webhook", "Failed to load webhook config for {instance}: {e}");
            }
        }

        if let Some(global) = &self.global
            && global.enabled
            && valid_url(&global.url)
        {
            self.deliver(&instance, envelope.event, global.url.clone(), body, owner)
                .await;
        }
    }

    async fn deliver(
        &self,
        instance: &str,
        event: EventKind,
        url: String,
        body: Vec<u8>,
        owner: Option<String>,
    ) {
        let agent = self.agent.clone();
        let post_url = url.clone();
        // ureq is blocking, so the POST runs on the blocking pool.
        let result = tokio::task::spawn_blocking(move || {
            let mut request = agent
                .post(&post_url)
                .header("Content-Type", "application/json");
            if let Some(owner) = &owner {
                request = request.header("Resource-Owner", owner);
            }
            let response = request.send(&body[..])?;
            Ok::<u16, anyhow::Error>(response.status().as_u16())
        })
        .await
        .unwrap_or_else(|e| Err(anyhow!("webhook task panicked: {e}")));

        match result {
            Ok(status) if status < 300 => {
                debug!(target: "Webhook", "Delivered {event} for {instance} to {url} ({status})");
            }
            Ok(status) => {
                self.record_failure(instance, event, &url, &format!("http status {status}"))
                    .await;
            }
            Err(e) => {
                self.record_failure(instance, event, &url, &e.to_string())
                    .await;
            }
        }
    }

    async fn record_failure(&self, instance: &str, event: EventKind, url: &str, error: &str) {
        warn!(target: "Webhook", "Delivery of {event} for {instance} to {url} failed: {error}");
        if !self.log_failures {
            return;
        }
        let row = ActivityRow {
            instance: instance.to_string(),
            event: event.as_dotted().to_string(),
            target_url: url.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = self.repository.log_activity(&row).await {
            warn!(target: "Webhook", "Failed to persist activity row: {e}");
        }
    }
}

fn valid_url(url: &str) -> bool {
    match url.parse::<ureq::http::Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.host().is_some()
        }
        Err(_) => false,
    }
}
