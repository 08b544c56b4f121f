//! Pairing-credential persistence.
//!
//! One store entry per instance: the serialized `AuthCreds` plus whatever
//! ephemeral signal artifacts the protocol layer writes alongside them
//! (`app-state-*`, `session-*`). The registry's periodic sweep strips the
//! ephemeral artifacts without destroying the pairing itself.

use crate::socket::AuthCreds;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::path::PathBuf;

const CREDS_FILE: &str = "creds.json";
const EPHEMERAL_PREFIXES: [&str; 2] = ["app-state-", "session-"];

#[async_trait]
pub trait AuthStateStore: Send + Sync {
    async fn read(&self, instance: &str) -> Result<Option<AuthCreds>>;

    async fn write(&self, instance: &str, creds: &AuthCreds) -> Result<()>;

    /// Removes every persisted artifact for the instance, pairing included.
    async fn remove(&self, instance: &str) -> Result<()>;

    /// Names of every instance with a persisted session, for boot discovery.
    async fn list_instances(&self) -> Result<Vec<String>>;

    /// Strips ephemeral signal artifacts, keeping the pairing credentials.
    /// Returns how many artifacts were removed.
    async fn clear_ephemeral(&self, instance: &str) -> Result<u64>;
}

/// Directory-per-instance filesystem backend.
pub struct FileAuthStore {
    base: PathBuf,
}

impl FileAuthStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.base.join(instance)
    }
}

#[async_trait]
impl AuthStateStore for FileAuthStore {
    async fn read(&self, instance: &str) -> Result<Option<AuthCreds>> {
        let path = self.instance_dir(instance).join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let creds = serde_json::from_slice(&raw)
                    .with_context(|| format!("corrupt creds file at {}", path.display()))?;
                Ok(Some(creds))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write(&self, instance: &str, creds: &AuthCreds) -> Result<()> {
        let dir = self.instance_dir(instance);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let raw = serde_json::to_vec(creds)?;
        tokio::fs::write(dir.join(CREDS_FILE), raw)
            .await
            .with_context(|| format!("writing creds for {instance}"))
    }

    async fn remove(&self, instance: &str) -> Result<()> {
        let dir = self.instance_dir(instance);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("listing {}", self.base.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn clear_ephemeral(&self, instance: &str) -> Result<u64> {
        let dir = self.instance_dir(instance);
        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if EPHEMERAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(target: "AuthStore", "Stripped {removed} ephemeral artifacts for {instance}");
        }
        Ok(removed)
    }
}

/// In-memory backend for tests and embedders that manage persistence
/// elsewhere.
#[derive(Default)]
pub struct MemoryAuthStore {
    creds: DashMap<String, AuthCreds>,
    ephemeral: DashMap<String, Vec<String>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named ephemeral artifact, as the protocol layer would.
    pub fn add_ephemeral(&self, instance: &str, artifact: &str) {
        self.ephemeral
            .entry(instance.to_string())
            .or_default()
            .push(artifact.to_string());
    }

    pub fn ephemeral_count(&self, instance: &str) -> usize {
        self.ephemeral.get(instance).map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AuthStateStore for MemoryAuthStore {
    async fn read(&self, instance: &str) -> Result<Option<AuthCreds>> {
        Ok(self.creds.get(instance).map(|c| c.clone()))
    }

    async fn write(&self, instance: &str, creds: &AuthCreds) -> Result<()> {
        self.creds.insert(instance.to_string(), creds.clone());
        Ok(())
    }

    async fn remove(&self, instance: &str) -> Result<()> {
        self.creds.remove(instance);
        self.ephemeral.remove(instance);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.creds.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn clear_ephemeral(&self, instance: &str) -> Result<u64> {
        let removed = self
            .ephemeral
            .remove(instance)
            .map(|(_, artifacts)| artifacts.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }
}
