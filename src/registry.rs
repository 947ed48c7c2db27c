//! Host-owned registry of open managers.
//!
//! One manager per distinct (agent, workspace, settings) triple. Asking
//! twice with equivalent configuration returns the same handle; changing
//! any setting yields a separate manager over its own index.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use memory_index_core::chunk::hash_text;

use crate::config::Config;
use crate::embedding::ProviderFactory;
use crate::manager::MemoryIndexManager;
use crate::sessions::SessionTranscriptBus;

pub struct ManagerRegistry {
    factory: Arc<dyn ProviderFactory>,
    bus: Option<SessionTranscriptBus>,
    managers: Mutex<HashMap<String, MemoryIndexManager>>,
}

/// Registry key: agent id, workspace, and a digest of the full settings.
pub fn registry_key(config: &Config) -> Result<String> {
    let settings = serde_json::to_string(config)?;
    let digest = hash_text(&settings);
    Ok(format!(
        "{}:{}:{}",
        config.agent_id,
        config.workspace_dir().display(),
        &digest[..16]
    ))
}

impl ManagerRegistry {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            bus: None,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Managers created from now on subscribe to `bus` for transcript
    /// updates.
    pub fn with_bus(mut self, bus: SessionTranscriptBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Return the manager for `config`, opening it and starting its
    /// background task on first use.
    pub async fn get(&self, config: Config) -> Result<MemoryIndexManager> {
        let key = registry_key(&config)?;
        let mut managers = self.managers.lock().await;
        if let Some(existing) = managers.get(&key) {
            return Ok(existing.clone());
        }
        let manager = MemoryIndexManager::open(config, Arc::clone(&self.factory)).await?;
        manager.start_background(self.bus.as_ref())?;
        info!(key = %key, "memory manager registered");
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    /// Close and forget one manager. Returns false if `key` was unknown.
    pub async fn close(&self, key: &str) -> bool {
        let removed = self.managers.lock().await.remove(key);
        match removed {
            Some(manager) => {
                manager.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<MemoryIndexManager> =
            self.managers.lock().await.drain().map(|(_, m)| m).collect();
        for manager in drained {
            manager.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
