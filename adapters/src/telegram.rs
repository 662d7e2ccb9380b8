//! Telegram adapter: Bot API webhook in, Bot API out.
//!
//! The webhook route is per-config (`/telegram/webhook/{config_id}`) since
//! Telegram updates carry no bot identity; authenticity comes from the
//! `X-Telegram-Bot-Api-Secret-Token` header registered with `setWebhook`.
//! Permission prompts use inline keyboards answered via `callback_query`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use courier_core::adapter::Adapter;
use courier_core::adapter::AdapterCapabilities;
use courier_core::adapter::ConnectionType;
use courier_core::adapter::CredentialCheck;
use courier_core::engine::Engine;
use courier_core::error::CourierErr;
use courier_core::error::Result;
use courier_core::permission;
use courier_core::store::ConfigStore as _;
use courier_protocol::AgentResponse;
use courier_protocol::Attachment;
use courier_protocol::AttachmentKind;
use courier_protocol::ChannelConfig;
use courier_protocol::ChatType;
use courier_protocol::FileOutput;
use courier_protocol::NormalizedMessage;
use courier_protocol::PermissionRequest;
use courier_protocol::PlatformKind;
use courier_protocol::PlatformUser;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use crate::text::chunk_text;

const TELEGRAM_API: &str = "https://api.telegram.org";
const TEXT_CHUNK_LIMIT: usize = 4096;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramAdapter {
    pub fn new() -> Self {
        Self::with_api_base(TELEGRAM_API)
    }

    /// Point the adapter at a different Bot API base (tests).
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn bot_token<'a>(&self, config: &'a ChannelConfig) -> Result<&'a str> {
        config
            .credentials
            .get("botToken")
            .and_then(Value::as_str)
            .ok_or_else(|| CourierErr::Adapter("telegram config has no botToken".to_string()))
    }

    async fn api_call(&self, token: &str, method: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/bot{}/{}", self.api_base, token, method))
            .json(&body)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        if value["ok"].as_bool() != Some(true) {
            let description = value["description"].as_str().unwrap_or("unknown error");
            return Err(CourierErr::Adapter(format!(
                "telegram {method} failed: {description}"
            )));
        }
        Ok(value["result"].clone())
    }

    /// Resolve Telegram file ids into fetchable URLs for the agent.
    async fn resolve_attachments(
        &self,
        config: &ChannelConfig,
        message: &Value,
    ) -> Vec<Attachment> {
        let mut found: Vec<(AttachmentKind, String, Option<String>, String, Option<u64>)> =
            Vec::new();

        if let Some(document) = message["document"].as_object() {
            if let Some(file_id) = document.get("file_id").and_then(Value::as_str) {
                found.push((
                    AttachmentKind::File,
                    file_id.to_string(),
                    document
                        .get("mime_type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    document
                        .get("file_name")
                        .and_then(Value::as_str)
                        .unwrap_or("document")
                        .to_string(),
                    document.get("file_size").and_then(Value::as_u64),
                ));
            }
        }
        // Photos arrive as a size ladder; the last entry is the largest.
        if let Some(photo) = message["photo"].as_array().and_then(|sizes| sizes.last()) {
            if let Some(file_id) = photo["file_id"].as_str() {
                found.push((
                    AttachmentKind::Image,
                    file_id.to_string(),
                    Some("image/jpeg".to_string()),
                    "photo.jpg".to_string(),
                    photo["file_size"].as_u64(),
                ));
            }
        }
        if let Some(voice) = message["voice"].as_object() {
            if let Some(file_id) = voice.get("file_id").and_then(Value::as_str) {
                found.push((
                    AttachmentKind::Audio,
                    file_id.to_string(),
                    voice
                        .get("mime_type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    "voice.ogg".to_string(),
                    voice.get("file_size").and_then(Value::as_u64),
                ));
            }
        }

        let Ok(token) = self.bot_token(config) else {
            return Vec::new();
        };
        let mut attachments = Vec::new();
        for (kind, file_id, mime_type, name, size) in found {
            match self
                .api_call(token, "getFile", json!({"file_id": file_id}))
                .await
            {
                Ok(file) => {
                    let Some(file_path) = file["file_path"].as_str() else {
                        continue;
                    };
                    attachments.push(Attachment {
                        kind,
                        url: format!("{}/file/bot{}/{}", self.api_base, token, file_path),
                        mime_type,
                        name,
                        size,
                    });
                }
                Err(e) => debug!(%file_id, "getFile failed: {e}"),
            }
        }
        attachments
    }

    async fn set_reaction(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        emoji: &str,
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        self.api_call(
            token,
            "setMessageReaction",
            json!({
                "chat_id": target.chat_id,
                "message_id": target.message_id,
                "reaction": [{"type": "emoji", "emoji": emoji}],
            }),
        )
        .await
        .map(|_| ())
    }
}

impl Default for TelegramAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Telegram
    }

    fn name(&self) -> &str {
        "telegram"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            text_chunk_limit: TEXT_CHUNK_LIMIT,
            supports_rich_text: false,
            supports_editing: false,
            supports_typing_indicator: true,
            supports_attachments: true,
            connection_type: ConnectionType::Webhook,
        }
    }

    fn register_routes(&self, router: Router, engine: Arc<Engine>) -> Router {
        let state = TelegramRoutes {
            engine,
            adapter: self.clone(),
        };
        let routes = Router::new()
            .route("/telegram/webhook/{config_id}", post(webhook_handler))
            .with_state(state);
        router.merge(routes)
    }

    async fn send_response(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        response: &AgentResponse,
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        let content = if response.content.is_empty() {
            "(no output)"
        } else {
            &response.content
        };
        for chunk in chunk_text(content, TEXT_CHUNK_LIMIT) {
            self.api_call(
                token,
                "sendMessage",
                json!({
                    "chat_id": target.chat_id,
                    "text": chunk,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn validate_credentials(&self, credentials: &mut serde_json::Map<String, Value>) -> CredentialCheck {
        let Some(token) = credentials.get("botToken").and_then(Value::as_str) else {
            return CredentialCheck::invalid("botToken is required");
        };
        match self.api_call(token, "getMe", json!({})).await {
            Ok(me) => {
                if let Some(username) = me["username"].as_str() {
                    credentials.insert("botUsername".to_string(), json!(username));
                }
                if let Some(id) = me["id"].as_i64() {
                    credentials.insert("botId".to_string(), json!(id.to_string()));
                }
                CredentialCheck::ok()
            }
            Err(e) => CredentialCheck::invalid(e.to_string()),
        }
    }

    async fn send_typing_indicator(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        self.api_call(
            token,
            "sendChatAction",
            json!({"chat_id": target.chat_id, "action": "typing"}),
        )
        .await
        .map(|_| ())
    }

    // Telegram's typing indicator expires on its own; nothing to clear.

    fn supports_reactions(&self) -> bool {
        true
    }

    async fn react_complete(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.set_reaction(config, message, "\u{1F44C}").await
    }

    async fn react_error(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.set_reaction(config, message, "\u{1F44E}").await
    }

    async fn react_files_changed(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.set_reaction(config, message, "\u{1F440}").await
    }

    async fn send_files(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        files: &[FileOutput],
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        for file in files {
            let Some(content) = &file.content else {
                continue;
            };
            let mut part =
                reqwest::multipart::Part::bytes(content.clone()).file_name(file.name.clone());
            if let Some(mime) = &file.mime_type {
                part = part
                    .mime_str(mime)
                    .map_err(|e| CourierErr::Adapter(format!("bad mime type: {e}")))?;
            }
            let form = reqwest::multipart::Form::new()
                .text("chat_id", target.chat_id.to_string())
                .part("document", part);
            let resp = self
                .http
                .post(format!("{}/bot{}/sendDocument", self.api_base, token))
                .multipart(form)
                .send()
                .await?;
            let value: Value = resp.json().await?;
            if value["ok"].as_bool() != Some(true) {
                let description = value["description"].as_str().unwrap_or("unknown error");
                return Err(CourierErr::Adapter(format!(
                    "telegram sendDocument failed: {description}"
                )));
            }
        }
        Ok(())
    }

    fn supports_permission_requests(&self) -> bool {
        true
    }

    async fn send_permission_request(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        request: &PermissionRequest,
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        self.api_call(
            token,
            "sendMessage",
            json!({
                "chat_id": target.chat_id,
                "text": format!(
                    "Permission requested: {} - {}",
                    request.tool, request.description
                ),
                "reply_markup": {
                    "inline_keyboard": [[
                        {"text": "Approve", "callback_data": format!("perm:1:{}", request.id)},
                        {"text": "Deny", "callback_data": format!("perm:0:{}", request.id)},
                    ]]
                },
            }),
        )
        .await
        .map(|_| ())
    }
}

struct ReplyTarget {
    chat_id: i64,
    message_id: i64,
}

impl ReplyTarget {
    fn of(message: &NormalizedMessage) -> Result<Self> {
        let chat_id = message.raw["chatId"]
            .as_i64()
            .ok_or_else(|| CourierErr::Adapter("telegram message has no chatId".to_string()))?;
        Ok(Self {
            chat_id,
            message_id: message.raw["messageId"].as_i64().unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------
// Webhook route
// ---------------------------------------------------------------------

#[derive(Clone)]
struct TelegramRoutes {
    engine: Arc<Engine>,
    adapter: TelegramAdapter,
}

async fn webhook_handler(
    State(state): State<TelegramRoutes>,
    Path(config_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<Value>,
) -> Response {
    let config = match state.engine.store().find_enabled_by_id(&config_id).await {
        Ok(Some(row)) => match row.hydrate() {
            Ok(config) => config,
            Err(e) => {
                warn!(%config_id, "failed to hydrate telegram config: {e}");
                return StatusCode::OK.into_response();
            }
        },
        _ => {
            debug!(%config_id, "update for unknown config; dropping");
            return StatusCode::OK.into_response();
        }
    };

    if !secret_token_matches(&config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Some(callback) = update.get("callback_query") {
        handle_callback(&state, &config, callback).await;
        return StatusCode::OK.into_response();
    }

    if let Some(message) = normalize_update(&config, &update) {
        let engine = state.engine.clone();
        let adapter = state.adapter.clone();
        let raw_message = update["message"].clone();
        tokio::spawn(async move {
            let mut message = message;
            message.attachments = adapter.resolve_attachments(&config, &raw_message).await;
            if let Err(e) = engine.process_message(message).await {
                warn!("telegram message processing failed: {e}");
            }
        });
    }
    StatusCode::OK.into_response()
}

fn secret_token_matches(config: &ChannelConfig, headers: &HeaderMap) -> bool {
    let Some(expected) = config
        .credentials
        .get("secretToken")
        .and_then(Value::as_str)
    else {
        // No secret registered with setWebhook; nothing to check.
        return true;
    };
    headers
        .get("x-telegram-bot-api-secret-token")
        .and_then(|v| v.to_str().ok())
        == Some(expected)
}

async fn handle_callback(state: &TelegramRoutes, config: &ChannelConfig, callback: &Value) {
    let data = callback["data"].as_str().unwrap_or_default();
    let Some((approved, permission_id)) = parse_permission_callback(data) else {
        return;
    };
    let delivered = permission::global().reply(permission_id, approved);
    debug!(permission_id, approved, delivered, "permission callback");

    if let Some(callback_id) = callback["id"].as_str() {
        let text = match (delivered, approved) {
            (true, true) => "Approved",
            (true, false) => "Denied",
            (false, _) => "Request already expired",
        };
        if let Ok(token) = state.adapter.bot_token(config) {
            if let Err(e) = state
                .adapter
                .api_call(
                    token,
                    "answerCallbackQuery",
                    json!({"callback_query_id": callback_id, "text": text}),
                )
                .await
            {
                debug!("answerCallbackQuery failed: {e}");
            }
        }
    }
}

fn parse_permission_callback(data: &str) -> Option<(bool, &str)> {
    let rest = data.strip_prefix("perm:")?;
    let (decision, id) = rest.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    match decision {
        "1" => Some((true, id)),
        "0" => Some((false, id)),
        _ => None,
    }
}

fn normalize_update(config: &ChannelConfig, update: &Value) -> Option<NormalizedMessage> {
    let message = update.get("message")?;
    let from = message.get("from")?;
    if from["is_bot"].as_bool() == Some(true) {
        return None;
    }

    let chat = &message["chat"];
    let chat_id = chat["id"].as_i64()?;
    let chat_type = match chat["type"].as_str().unwrap_or_default() {
        "private" => ChatType::Dm,
        "group" | "supergroup" => ChatType::Group,
        _ => ChatType::Channel,
    };

    let text = message["text"]
        .as_str()
        .or_else(|| message["caption"].as_str())
        .unwrap_or_default();
    let bot_username = config
        .credentials
        .get("botUsername")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mention_tag = format!("@{bot_username}");
    let mentioned = !bot_username.is_empty() && text.contains(&mention_tag);

    if chat_type != ChatType::Dm && config.require_mention_in_groups() && !mentioned {
        return None;
    }

    let content = if bot_username.is_empty() {
        text.trim().to_string()
    } else {
        text.replace(&mention_tag, "").trim().to_string()
    };
    if content.is_empty() && message["document"].is_null() && message["photo"].is_null() {
        return None;
    }

    let message_id = message["message_id"].as_i64()?;
    let user_id = from["id"].as_i64()?;
    Some(NormalizedMessage {
        external_id: message_id.to_string(),
        platform: PlatformKind::Telegram,
        config_id: config.id.clone(),
        chat_type,
        content,
        attachments: Vec::new(),
        user: PlatformUser {
            id: user_id.to_string(),
            name: from["username"]
                .as_str()
                .or_else(|| from["first_name"].as_str())
                .unwrap_or("user")
                .to_string(),
            avatar: None,
        },
        thread_id: message["message_thread_id"].as_i64().map(|t| t.to_string()),
        group_id: (chat_type != ChatType::Dm).then(|| chat_id.to_string()),
        mentioned,
        thread_context: Vec::new(),
        overrides: Default::default(),
        raw: json!({"chatId": chat_id, "messageId": message_id}),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn test_config() -> ChannelConfig {
        let mut credentials = serde_json::Map::new();
        credentials.insert("botToken".to_string(), json!("123:abc"));
        credentials.insert("botUsername".to_string(), json!("courier_bot"));
        ChannelConfig {
            id: "cfg-tg".to_string(),
            platform: PlatformKind::Telegram,
            name: "bot".to_string(),
            enabled: true,
            credentials,
            platform_config: Default::default(),
            metadata: Default::default(),
            session_strategy: Default::default(),
            system_prompt: None,
            agent_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn private_text_message_normalizes() {
        let update = json!({
            "message": {
                "message_id": 7,
                "from": {"id": 42, "is_bot": false, "first_name": "Alice"},
                "chat": {"id": 42, "type": "private"},
                "text": "hello"
            }
        });
        let message = normalize_update(&test_config(), &update).unwrap();
        assert_eq!(message.chat_type, ChatType::Dm);
        assert_eq!(message.content, "hello");
        assert_eq!(message.external_id, "7");
        assert_eq!(message.raw["chatId"], 42);
    }

    #[test]
    fn bot_messages_and_empty_updates_are_dropped() {
        let bot_update = json!({
            "message": {
                "message_id": 8,
                "from": {"id": 1, "is_bot": true},
                "chat": {"id": 42, "type": "private"},
                "text": "echo"
            }
        });
        assert!(normalize_update(&test_config(), &bot_update).is_none());

        let empty = json!({
            "message": {
                "message_id": 9,
                "from": {"id": 42, "is_bot": false},
                "chat": {"id": 42, "type": "private"}
            }
        });
        assert!(normalize_update(&test_config(), &empty).is_none());
    }

    #[test]
    fn group_mention_is_stripped_and_flagged() {
        let update = json!({
            "message": {
                "message_id": 10,
                "from": {"id": 42, "is_bot": false, "username": "alice"},
                "chat": {"id": -100, "type": "supergroup"},
                "text": "@courier_bot status please"
            }
        });
        let message = normalize_update(&test_config(), &update).unwrap();
        assert!(message.mentioned);
        assert_eq!(message.content, "status please");
        assert_eq!(message.group_id.as_deref(), Some("-100"));
    }

    #[test]
    fn permission_callback_data_round_trips() {
        assert_eq!(parse_permission_callback("perm:1:p9"), Some((true, "p9")));
        assert_eq!(parse_permission_callback("perm:0:p9"), Some((false, "p9")));
        assert_eq!(parse_permission_callback("perm:2:p9"), None);
        assert_eq!(parse_permission_callback("perm:1:"), None);
        assert_eq!(parse_permission_callback("other"), None);
    }
}
