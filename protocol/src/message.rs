use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::config::ModelRef;

/// Chat platform a config is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Slack,
    Discord,
    Telegram,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            PlatformKind::Slack => "slack",
            PlatformKind::Discord => "discord",
            PlatformKind::Telegram => "telegram",
        };
        write!(f, "{tag}")
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slack" => Ok(PlatformKind::Slack),
            "discord" => Ok(PlatformKind::Discord),
            "telegram" => Ok(PlatformKind::Telegram),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Where the inbound message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dm,
    Group,
    Channel,
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ChatType::Dm => "dm",
            ChatType::Group => "group",
            ChatType::Channel => "channel",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    File,
}

/// A media or file attachment carried by an inbound message. The `url` must
/// be fetchable by the agent server; adapters resolve short-lived platform
/// URLs before handing the message to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// One prior message from the thread the inbound message replies into,
/// oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadContextEntry {
    pub sender: String,
    pub text: String,
    #[serde(rename = "isBot")]
    pub is_bot: bool,
}

/// Per-message overrides, e.g. from a slash command that pins a model for a
/// single prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(rename = "agentName", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl MessageOverrides {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.agent_name.is_none()
    }
}

/// The uniform message form every adapter produces and the engine consumes.
///
/// `raw` is the opaque platform payload; the engine passes it back untouched
/// to the same adapter for reply targeting (thread ts, chat id, response
/// url), and never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Platform-native message identifier.
    pub external_id: String,
    pub platform: PlatformKind,
    pub config_id: String,
    pub chat_type: ChatType,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub user: PlatformUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub mentioned: bool,
    #[serde(default)]
    pub thread_context: Vec<ThreadContextEntry>,
    #[serde(default)]
    pub overrides: MessageOverrides,
    #[serde(default)]
    pub raw: serde_json::Value,
}
