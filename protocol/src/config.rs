use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::message::PlatformKind;

/// Policy by which inbound messages are bucketed into upstream sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategy {
    Single,
    #[default]
    PerUser,
    PerThread,
    PerMessage,
}

/// A pinned upstream model, as stored in config metadata under `model` and
/// as carried by per-message overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Parse `provider/model` as typed by a user in a slash command.
    pub fn parse(spec: &str) -> Option<Self> {
        let (provider_id, model_id) = spec.split_once('/')?;
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Configuration for one bound chat surface, hydrated from the store.
///
/// The three bags are opaque: `credentials` and `platform_config` belong to
/// the adapter for this platform, `metadata` to the slash-command subsystem.
/// The engine only reads the named keys documented on the accessors below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub platform: PlatformKind,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub platform_config: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub session_strategy: SessionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelConfig {
    /// The pinned model from `metadata.model`, if present and well-formed.
    pub fn pinned_model(&self) -> Option<ModelRef> {
        let value = self.metadata.get("model")?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Channel-specific instructions from `platformConfig.channelPrompts`,
    /// keyed by the platform group/channel id.
    pub fn channel_prompt(&self, group_id: &str) -> Option<String> {
        self.platform_config
            .get("channelPrompts")?
            .get(group_id)?
            .as_str()
            .map(str::to_string)
    }

    /// Whether the `groups.requireMention` knob is set for this surface.
    pub fn require_mention_in_groups(&self) -> bool {
        self.platform_config
            .get("groups")
            .and_then(|g| g.get("requireMention"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
