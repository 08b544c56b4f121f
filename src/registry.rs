//! Instance registry: the process-wide map of live runtimes, plus the
//! background chores that keep it honest (teardown signals, idle eviction,
//! periodic ephemeral-state sweeps).

use crate::auth::AuthStateStore;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::hub::RealtimeHub;
use crate::instance::{ConnectionState, InstanceRuntime, RuntimeDeps};
use crate::repository::Repository;
use crate::socket::SocketFactory;
use crate::token::TokenKeeper;
use crate::webhook::WebhookDispatcher;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Out-of-band notifications from runtimes back to the registry. Runtimes
/// never touch the registry directly; teardown always flows through here so
/// an instance cannot deadlock on its own removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySignal {
    /// The instance logged out (or was logged out remotely): evict it and
    /// delete its stored state.
    RemoveInstance(String),
    /// Pairing never completed (QR limit breached): evict it and drop the
    /// partial pairing state, but keep the persisted instance record.
    NoConnection(String),
}

pub struct InstanceRegistry {
    deps: RuntimeDeps,
    instances: DashMap<String, Arc<InstanceRuntime>>,
    token_keeper: TokenKeeper,
}

impl InstanceRegistry {
    pub fn new(
        config: GatewayConfig,
        repository: Arc<dyn Repository>,
        auth_store: Arc<dyn AuthStateStore>,
        hub: Arc<RealtimeHub>,
        socket_factory: Arc<dyn SocketFactory>,
    ) -> Arc<Self> {
        let webhook = Arc::new(WebhookDispatcher::new(&config, repository.clone()));
        let token_keeper = TokenKeeper::new(config.token_secret.as_bytes());
        let (signals, signal_rx) = mpsc::channel(64);
        let deps = RuntimeDeps {
            config: Arc::new(config),
            repository,
            auth_store,
            webhook,
            hub,
            socket_factory,
            signals,
        };
        let registry = Arc::new(Self {
            deps,
            instances: DashMap::new(),
            token_keeper,
        });

        tokio::spawn(registry.clone().signal_loop(signal_rx));
        tokio::spawn(registry.clone().sweep_loop());
        registry
    }

    pub fn token_keeper(&self) -> TokenKeeper {
        self.token_keeper.clone()
    }

    /// Mints a realtime-hub bearer token for an existing instance.
    pub fn hub_token(&self, name: &str, ttl: Duration) -> Result<String> {
        if !self.instances.contains_key(name) {
            return Err(GatewayError::NotFound(name.to_string()));
        }
        Ok(self.token_keeper.mint(name, ttl))
    }

    /// Boot-time load: starts a runtime for every instance with persisted
    /// auth state. Per-instance failures are logged and skipped so one bad
    /// session cannot keep the rest offline.
    pub async fn load(self: &Arc<Self>) -> Result<usize> {
        let names = self
            .deps
            .auth_store
            .list_instances()
            .await
            .map_err(GatewayError::Internal)?;
        let mut started = 0;
        for name in names {
            match self.start_runtime(&name).await {
                Ok(_) => started += 1,
                Err(e) => {
                    error!(target: "Registry", "Failed to restore instance \"{name}\": {e}");
                }
            }
        }
        info!(target: "Registry", "Restored {started} instance(s) from storage");
        Ok(started)
    }

    /// Creates (or revives) an instance and starts its connection.
    pub async fn create(self: &Arc<Self>, name: &str) -> Result<Arc<InstanceRuntime>> {
        validate_name(name)?;
        if let Some(existing) = self.instances.get(name).map(|r| r.clone()) {
            if !existing.is_stopping() {
                return Err(GatewayError::BadRequest(format!(
                    "instance \"{name}\" already exists"
                )));
            }
            // A stale runtime mid-teardown can be replaced.
            self.instances.remove(name);
        }
        self.start_runtime(name).await
    }

    async fn start_runtime(self: &Arc<Self>, name: &str) -> Result<Arc<InstanceRuntime>> {
        let runtime = InstanceRuntime::new(name.to_string(), self.deps.clone());
        self.instances.insert(name.to_string(), runtime.clone());
        if let Err(e) = runtime.connect().await {
            self.instances.remove(name);
            return Err(e);
        }
        if let Some(delay) = self.deps.config.idle_eviction {
            tokio::spawn(self.clone().evict_if_idle(name.to_string(), delay));
        }
        Ok(runtime)
    }

    /// Drops an instance from memory if it never reached `open` within the
    /// configured grace period. Stored state is untouched.
    async fn evict_if_idle(self: Arc<Self>, name: String, delay: Duration) {
        sleep(delay).await;
        let Some(runtime) = self.instances.get(&name).map(|r| r.clone()) else {
            return;
        };
        if runtime.connection_status().await.state == ConnectionState::Open {
            return;
        }
        warn!(target: "Registry", "Instance \"{name}\" never connected, evicting from memory");
        runtime.close().await;
        self.instances.remove(&name);
        self.deps.hub.remove_instance(&name);
    }

    pub fn get(&self, name: &str) -> Result<Arc<InstanceRuntime>> {
        self.instances
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Explicit logout. The runtime signals back and the signal loop does
    /// the actual eviction and storage cleanup.
    pub async fn logout(&self, name: &str) -> Result<()> {
        self.get(name)?.logout().await
    }

    /// Removes an instance. A connected instance is only removed with
    /// `force`, which closes the socket without logging out so the pairing
    /// can be reused elsewhere.
    pub async fn delete(&self, name: &str, force: bool) -> Result<()> {
        if let Ok(runtime) = self.get(name) {
            if runtime.connection_status().await.state == ConnectionState::Open && !force {
                return Err(GatewayError::BadRequest(format!(
                    "instance \"{name}\" is connected; log out first or force deletion"
                )));
            }
            runtime.close().await;
        }
        self.cleanup(name, true).await;
        Ok(())
    }

    /// Eviction plus storage cleanup. Every step is best-effort: a failing
    /// store must not leave the runtime resident.
    async fn cleanup(&self, name: &str, drop_repository_record: bool) {
        self.instances.remove(name);
        self.deps.hub.remove_instance(name);
        if let Err(e) = self.deps.auth_store.remove(name).await {
            warn!(target: "Registry", "Failed to remove auth state for \"{name}\": {e}");
        }
        if drop_repository_record
            && let Err(e) = self.deps.repository.delete_instance(name).await
        {
            warn!(target: "Registry", "Failed to delete instance record for \"{name}\": {e}");
        }
        info!(target: "Registry", "Instance \"{name}\" removed");
    }

    async fn signal_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RegistrySignal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                RegistrySignal::RemoveInstance(name) => {
                    debug!(target: "Registry", "Teardown signal for \"{name}\"");
                    self.cleanup(&name, true).await;
                }
                RegistrySignal::NoConnection(name) => {
                    debug!(target: "Registry", "Pairing-failure signal for \"{name}\"");
                    // The persisted record stays (status: refused); only the
                    // runtime and the partial pairing state go.
                    self.cleanup(&name, false).await;
                }
            }
        }
        debug!(target: "Registry", "Signal channel closed");
    }

    /// Periodically strips ephemeral session artifacts (app-state versions,
    /// signal sessions) from every stored instance.
    async fn sweep_loop(self: Arc<Self>) {
        let interval = self.deps.config.sweep_interval;
        loop {
            sleep(interval).await;
            let names = match self.deps.auth_store.list_instances().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(target: "Registry", "Sweep could not list instances: {e}");
                    continue;
                }
            };
            let mut removed = 0u64;
            for name in names {
                match self.deps.auth_store.clear_ephemeral(&name).await {
                    Ok(count) => removed += count,
                    Err(e) => {
                        warn!(target: "Registry", "Sweep failed for \"{name}\": {e}");
                    }
                }
            }
            if removed > 0 {
                info!(target: "Registry", "Sweep removed {removed} ephemeral artifact(s)");
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(GatewayError::BadRequest(
            "instance name must be 1-64 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(GatewayError::BadRequest(format!(
            "invalid instance name \"{name}\": only letters, digits, '-' and '_' are allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("shop1").is_ok());
        assert!(validate_name("shop-one_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("shop one").is_err());
        assert!(validate_name("shop/one").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }
}
