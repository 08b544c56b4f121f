use std::str::FromStr;
use std::time::Duration;

/// Globally configured webhook target, applied to every instance in addition
/// to each instance's own webhook configuration.
#[derive(Debug, Clone)]
pub struct GlobalWebhook {
    pub url: String,
    pub enabled: bool,
}

/// Gateway-wide configuration.
///
/// Everything has a usable default; `from_env` overrides from `WAGATEWAY_*`
/// variables so embedders can tune deployments without code changes.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum number of QR pairing challenges before the instance is
    /// refused and torn down.
    pub qr_limit: u32,
    /// Persist inbound/outbound message records.
    pub store_new_message: bool,
    /// Persist delivery-status updates.
    pub store_message_update: bool,
    /// Persist chat upserts.
    pub store_chats: bool,
    /// Persist contact upserts.
    pub store_contacts: bool,
    /// Record webhook delivery failures as activity-log rows.
    pub log_webhook_failures: bool,
    pub global_webhook: Option<GlobalWebhook>,
    /// Request timeout applied to every webhook POST.
    pub webhook_timeout: Duration,
    /// Drop an instance from the in-memory registry if its connection has
    /// not reached `open` within this delay. Storage is untouched.
    pub idle_eviction: Option<Duration>,
    /// Interval of the background sweep that strips ephemeral session/key
    /// artifacts from the auth store.
    pub sweep_interval: Duration,
    /// Secret used to sign realtime-hub bearer tokens.
    pub token_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            qr_limit: 6,
            store_new_message: true,
            store_message_update: true,
            store_chats: true,
            store_contacts: true,
            log_webhook_failures: false,
            global_webhook: None,
            webhook_timeout: Duration::from_secs(30),
            idle_eviction: None,
            sweep_interval: Duration::from_secs(2 * 60 * 60),
            token_secret: String::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(limit) = env_parse("WAGATEWAY_QRCODE_LIMIT") {
            cfg.qr_limit = limit;
        }
        if let Some(v) = env_parse("WAGATEWAY_STORE_NEW_MESSAGE") {
            cfg.store_new_message = v;
        }
        if let Some(v) = env_parse("WAGATEWAY_STORE_MESSAGE_UPDATE") {
            cfg.store_message_update = v;
        }
        if let Some(v) = env_parse("WAGATEWAY_STORE_CHATS") {
            cfg.store_chats = v;
        }
        if let Some(v) = env_parse("WAGATEWAY_STORE_CONTACTS") {
            cfg.store_contacts = v;
        }
        if let Some(v) = env_parse("WAGATEWAY_LOG_WEBHOOK_FAILURES") {
            cfg.log_webhook_failures = v;
        }
        if let Ok(url) = std::env::var("WAGATEWAY_WEBHOOK_GLOBAL_URL") {
            let enabled = env_parse("WAGATEWAY_WEBHOOK_GLOBAL_ENABLED").unwrap_or(true);
            cfg.global_webhook = Some(GlobalWebhook { url, enabled });
        }
        if let Some(secs) = env_parse::<u64>("WAGATEWAY_WEBHOOK_TIMEOUT_SECS") {
            cfg.webhook_timeout = Duration::from_secs(secs);
        }
        if let Some(minutes) = env_parse::<u64>("WAGATEWAY_DEL_INSTANCE_MINUTES") {
            cfg.idle_eviction = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
        }
        if let Some(secs) = env_parse::<u64>("WAGATEWAY_SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Ok(secret) = std::env::var("WAGATEWAY_TOKEN_SECRET") {
            cfg.token_secret = secret;
        }
        cfg
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.qr_limit, 6);
        assert!(cfg.store_new_message);
        assert!(cfg.global_webhook.is_none());
        assert_eq!(cfg.sweep_interval, Duration::from_secs(7200));
        assert!(cfg.idle_eviction.is_none());
    }
}
