// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The configuration store the engine reads per inbound message.
//!
//! A row is the at-rest form: the three bags are JSON strings (credentials
//! possibly sealed) and hydration turns a row into a [`ChannelConfig`]. The
//! store also owns the append-only message log; log failures degrade to
//! warnings and never stall the pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use courier_protocol::ChannelConfig;
use courier_protocol::PlatformKind;
use courier_protocol::SessionStrategy;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use crate::credentials;
use crate::error::CourierErr;
use crate::error::Result;
use crate::message_log;
use crate::message_log::MessageLogEntry;

/// One stored channel configuration, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRow {
    pub id: String,
    pub platform: PlatformKind,
    pub name: String,
    pub enabled: bool,
    /// JSON object, sealed when a credential key is configured.
    #[serde(default)]
    pub credentials: String,
    /// JSON object with platform-specific knobs.
    #[serde(default)]
    pub platform_config: String,
    /// JSON object with engine-facing metadata (pinned model, etc).
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub session_strategy: SessionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Platform-side identity used to demultiplex webhooks onto configs
    /// (Slack team id, Telegram bot id, Discord application id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigRow {
    /// Parse the opaque JSON columns and decrypt credentials.
    pub fn hydrate(&self) -> Result<ChannelConfig> {
        Ok(ChannelConfig {
            id: self.id.clone(),
            platform: self.platform,
            name: self.name.clone(),
            enabled: self.enabled,
            credentials: credentials::open_bag(&self.credentials)?,
            platform_config: parse_bag(&self.platform_config, "platform_config")?,
            metadata: parse_bag(&self.metadata, "metadata")?,
            session_strategy: self.session_strategy,
            system_prompt: self.system_prompt.clone(),
            agent_name: self.agent_name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_bag(raw: &str, column: &str) -> Result<Map<String, Value>> {
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(bag)) => Ok(bag),
        Ok(_) => Err(CourierErr::Store(format!(
            "{column} column is not a JSON object"
        ))),
        Err(e) => Err(CourierErr::Store(format!("{column} column is invalid: {e}"))),
    }
}

/// Partial update applied by slash-command paths. `None` leaves a field
/// untouched; the double-`Option` fields distinguish "clear" from "keep".
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub metadata: Option<Map<String, Value>>,
    pub agent_name: Option<Option<String>>,
    pub system_prompt: Option<Option<String>>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn find_enabled_by_id(&self, id: &str) -> Result<Option<ConfigRow>>;

    /// Look up the enabled config bound to a platform-side identity.
    async fn find_enabled_by_platform_key(
        &self,
        platform: PlatformKind,
        key: &str,
    ) -> Result<Option<ConfigRow>>;

    async fn list_enabled(&self) -> Result<Vec<ConfigRow>>;

    async fn update(&self, id: &str, patch: ConfigPatch) -> Result<()>;

    /// Append an audit row. Implementations log and swallow their own I/O
    /// failures; this call must not stall the pipeline.
    async fn append_message(&self, entry: MessageLogEntry);
}

/// File-backed store: a JSON table of rows plus a JSONL message log, both
/// under one data directory.
pub struct JsonConfigStore {
    configs_path: PathBuf,
    log_path: PathBuf,
    rows: RwLock<HashMap<String, ConfigRow>>,
}

impl JsonConfigStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let configs_path = data_dir.join("configs.json");
        let log_path = data_dir.join("messages.jsonl");

        let rows = if configs_path.exists() {
            let raw = std::fs::read_to_string(&configs_path)?;
            let list: Vec<ConfigRow> = serde_json::from_str(&raw)
                .map_err(|e| CourierErr::Store(format!("configs.json is invalid: {e}")))?;
            list.into_iter().map(|row| (row.id.clone(), row)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            configs_path,
            log_path,
            rows: RwLock::new(rows),
        })
    }

    /// Insert or replace a row and persist. Used by setup tooling and the
    /// channel-created hook, not by the per-message pipeline.
    pub fn upsert(&self, row: ConfigRow) -> Result<()> {
        {
            let mut rows = self.rows.write().unwrap();
            rows.insert(row.id.clone(), row);
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let serialized = {
            let rows = self.rows.read().unwrap();
            let mut list: Vec<&ConfigRow> = rows.values().collect();
            list.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_string_pretty(&list)?
        };
        if let Some(parent) = self.configs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.configs_path, serialized)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn find_enabled_by_id(&self, id: &str) -> Result<Option<ConfigRow>> {
        let rows = self.rows.read().unwrap();
        Ok(rows.get(id).filter(|row| row.enabled).cloned())
    }

    async fn find_enabled_by_platform_key(
        &self,
        platform: PlatformKind,
        key: &str,
    ) -> Result<Option<ConfigRow>> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .find(|row| {
                row.enabled && row.platform == platform && row.platform_key.as_deref() == Some(key)
            })
            .cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ConfigRow>> {
        let rows = self.rows.read().unwrap();
        let mut list: Vec<ConfigRow> = rows.values().filter(|row| row.enabled).cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn update(&self, id: &str, patch: ConfigPatch) -> Result<()> {
        {
            let mut rows = self.rows.write().unwrap();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| CourierErr::ConfigNotFound(id.to_string()))?;
            if let Some(name) = patch.name {
                row.name = name;
            }
            if let Some(enabled) = patch.enabled {
                row.enabled = enabled;
            }
            if let Some(metadata) = patch.metadata {
                row.metadata = serde_json::to_string(&metadata)?;
            }
            if let Some(agent_name) = patch.agent_name {
                row.agent_name = agent_name;
            }
            if let Some(system_prompt) = patch.system_prompt {
                row.system_prompt = system_prompt;
            }
            row.updated_at = Utc::now();
        }
        self.persist()
    }

    async fn append_message(&self, entry: MessageLogEntry) {
        if let Err(e) = message_log::append_entry(&self.log_path, &entry).await {
            warn!(config_id = %entry.config_id, "failed to append message log entry: {e}");
        }
    }
}
