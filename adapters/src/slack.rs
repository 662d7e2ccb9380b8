//! Slack adapter: Events API webhook in, Web API out.
//!
//! Inbound requests are authenticated with the v0 HMAC-SHA256 signature
//! scheme against the config's signing secret, after the team id in the
//! payload has selected the config. Replies go out through
//! `chat.postMessage` in chunks, files through `files.upload`, permission
//! prompts as interactive button blocks answered on the interactivity
//! route.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use chrono::Utc;
use courier_core::adapter::Adapter;
use courier_core::adapter::AdapterCapabilities;
use courier_core::adapter::ConnectionType;
use courier_core::adapter::CredentialCheck;
use courier_core::commands;
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
use courier_protocol::ThreadContextEntry;
use hmac::Hmac;
use hmac::Mac;
use serde_json::Value;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use crate::text::chunk_text;

type HmacSha256 = Hmac<Sha256>;

const SLACK_API: &str = "https://slack.com/api";
const TEXT_CHUNK_LIMIT: usize = 4000;
const SIGNATURE_SKEW_SECS: i64 = 300;
const THREAD_CONTEXT_LIMIT: usize = 20;

#[derive(Clone)]
pub struct SlackAdapter {
    http: reqwest::Client,
    api_base: String,
}

impl SlackAdapter {
    pub fn new() -> Self {
        Self::with_api_base(SLACK_API)
    }

    /// Point the adapter at a different Web API base (tests).
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
            .ok_or_else(|| CourierErr::Adapter("slack config has no botToken".to_string()))
    }

    async fn api_call(&self, token: &str, method: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        if value["ok"].as_bool() != Some(true) {
            let error = value["error"].as_str().unwrap_or("unknown_error");
            return Err(CourierErr::Adapter(format!("slack {method} failed: {error}")));
        }
        Ok(value)
    }

    async fn api_get(&self, token: &str, method: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/{}", self.api_base, method))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        if value["ok"].as_bool() != Some(true) {
            let error = value["error"].as_str().unwrap_or("unknown_error");
            return Err(CourierErr::Adapter(format!("slack {method} failed: {error}")));
        }
        Ok(value)
    }

    async fn add_reaction(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        name: &str,
    ) -> Result<()> {
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        match self
            .api_call(
                token,
                "reactions.add",
                json!({
                    "channel": target.channel,
                    "timestamp": target.ts,
                    "name": name,
                }),
            )
            .await
        {
            Ok(_) => Ok(()),
            // Repeat deliveries hit this; the reaction is already there.
            Err(CourierErr::Adapter(e)) if e.contains("already_reacted") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Prior messages of the thread the inbound message replies into,
    /// oldest first. Slack `ts` values are ordered numerically, not
    /// lexicographically.
    pub(crate) async fn fetch_thread_context(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<Vec<ThreadContextEntry>> {
        let Some(thread_ts) = message.thread_id.as_deref() else {
            return Ok(Vec::new());
        };
        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        let limit = THREAD_CONTEXT_LIMIT.to_string();
        let value = self
            .api_get(
                token,
                "conversations.replies",
                &[
                    ("channel", target.channel.as_str()),
                    ("ts", thread_ts),
                    ("limit", limit.as_str()),
                ],
            )
            .await?;

        let bot_user_id = config
            .credentials
            .get("botUserId")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut replies: Vec<&Value> = value["messages"]
            .as_array()
            .map(|m| m.iter().collect())
            .unwrap_or_default();
        replies.sort_by(|a, b| {
            let ts_a = a["ts"].as_str().and_then(|t| t.parse::<f64>().ok());
            let ts_b = b["ts"].as_str().and_then(|t| t.parse::<f64>().ok());
            ts_a.partial_cmp(&ts_b).unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(replies
            .into_iter()
            .filter(|reply| reply["ts"].as_str() != Some(message.external_id.as_str()))
            .filter_map(|reply| {
                let text = reply["text"].as_str()?;
                let user = reply["user"].as_str().unwrap_or_default();
                let is_bot =
                    reply["bot_id"].is_string() || (!user.is_empty() && user == bot_user_id);
                Some(ThreadContextEntry {
                    sender: reply["username"]
                        .as_str()
                        .unwrap_or(user)
                        .to_string(),
                    text: text.to_string(),
                    is_bot,
                })
            })
            .collect())
    }
}

impl Default for SlackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for SlackAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Slack
    }

    fn name(&self) -> &str {
        "slack"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            text_chunk_limit: TEXT_CHUNK_LIMIT,
            supports_rich_text: true,
            supports_editing: true,
            supports_typing_indicator: false,
            supports_attachments: true,
            connection_type: ConnectionType::Webhook,
        }
    }

    fn register_routes(&self, router: Router, engine: Arc<Engine>) -> Router {
        let state = SlackRoutes {
            engine,
            adapter: self.clone(),
        };
        let routes = Router::new()
            .route("/slack/events", post(events_handler))
            .route("/slack/interactions", post(interactions_handler))
            .route("/slack/commands", post(commands_handler))
            .with_state(state);
        router.merge(routes)
    }

    async fn send_response(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        response: &AgentResponse,
    ) -> Result<()> {
        // Slash-command replies carry a response url instead of a channel.
        if let Some(response_url) = message.raw["responseUrl"].as_str() {
            let resp = self
                .http
                .post(response_url)
                .json(&json!({
                    "response_type": "in_channel",
                    "text": response.content,
                }))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(CourierErr::Adapter(format!(
                    "slack response_url delivery failed: {}",
                    resp.status()
                )));
            }
            return Ok(());
        }

        let token = self.bot_token(config)?;
        let target = ReplyTarget::of(message)?;
        let content = if response.content.is_empty() {
            "_(no output)_"
        } else {
            &response.content
        };
        for chunk in chunk_text(content, TEXT_CHUNK_LIMIT) {
            let mut body = json!({
                "channel": target.channel,
                "text": chunk,
            });
            if let Some(thread_ts) = target.thread_ts() {
                body["thread_ts"] = json!(thread_ts);
            }
            self.api_call(token, "chat.postMessage", body).await?;
        }
        Ok(())
    }

    async fn validate_credentials(&self, credentials: &mut serde_json::Map<String, Value>) -> CredentialCheck {
        let Some(token) = credentials.get("botToken").and_then(Value::as_str) else {
            return CredentialCheck::invalid("botToken is required");
        };
        if credentials
            .get("signingSecret")
            .and_then(Value::as_str)
            .is_none()
        {
            return CredentialCheck::invalid("signingSecret is required");
        }
        match self.api_call(token, "auth.test", json!({})).await {
            Ok(value) => {
                if let Some(bot_user_id) = value["user_id"].as_str() {
                    credentials.insert("botUserId".to_string(), json!(bot_user_id));
                }
                if let Some(team_id) = value["team_id"].as_str() {
                    credentials.insert("teamId".to_string(), json!(team_id));
                }
                CredentialCheck::ok()
            }
            Err(e) => CredentialCheck::invalid(e.to_string()),
        }
    }

    fn supports_reactions(&self) -> bool {
        true
    }

    async fn react_complete(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.add_reaction(config, message, "white_check_mark").await
    }

    async fn react_error(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.add_reaction(config, message, "x").await
    }

    async fn react_files_changed(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
    ) -> Result<()> {
        self.add_reaction(config, message, "open_file_folder").await
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
            let mut form = reqwest::multipart::Form::new()
                .text("channels", target.channel.clone())
                .text("filename", file.name.clone())
                .part("file", part);
            if let Some(thread_ts) = target.thread_ts() {
                form = form.text("thread_ts", thread_ts.to_string());
            }
            let resp = self
                .http
                .post(format!("{}/files.upload", self.api_base))
                .bearer_auth(token)
                .multipart(form)
                .send()
                .await?;
            let value: Value = resp.json().await?;
            if value["ok"].as_bool() != Some(true) {
                let error = value["error"].as_str().unwrap_or("unknown_error");
                return Err(CourierErr::Adapter(format!(
                    "slack files.upload failed: {error}"
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
        let mut body = json!({
            "channel": target.channel,
            "text": format!("Permission requested: {} - {}", request.tool, request.description),
            "blocks": [
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!(
                            "*Permission requested*\n`{}` - {}",
                            request.tool, request.description
                        ),
                    }
                },
                {
                    "type": "actions",
                    "elements": [
                        {
                            "type": "button",
                            "style": "primary",
                            "text": {"type": "plain_text", "text": "Approve"},
                            "action_id": "permission_approve",
                            "value": request.id,
                        },
                        {
                            "type": "button",
                            "style": "danger",
                            "text": {"type": "plain_text", "text": "Deny"},
                            "action_id": "permission_deny",
                            "value": request.id,
                        }
                    ]
                }
            ],
        });
        if let Some(thread_ts) = target.thread_ts() {
            body["thread_ts"] = json!(thread_ts);
        }
        self.api_call(token, "chat.postMessage", body).await?;
        Ok(())
    }
}

/// Where a reply to this message goes, pulled from the opaque `raw` bag the
/// events handler stashed.
struct ReplyTarget {
    channel: String,
    ts: String,
    thread_ts_raw: Option<String>,
}

impl ReplyTarget {
    fn of(message: &NormalizedMessage) -> Result<Self> {
        let channel = message.raw["channel"]
            .as_str()
            .ok_or_else(|| CourierErr::Adapter("slack message has no channel".to_string()))?;
        Ok(Self {
            channel: channel.to_string(),
            ts: message.raw["ts"].as_str().unwrap_or_default().to_string(),
            thread_ts_raw: message.raw["thread_ts"].as_str().map(str::to_string),
        })
    }

    /// Replies land in the thread the message came from; a top-level
    /// message starts a thread rooted at itself.
    fn thread_ts(&self) -> Option<&str> {
        self.thread_ts_raw
            .as_deref()
            .or((!self.ts.is_empty()).then_some(self.ts.as_str()))
    }
}

// ---------------------------------------------------------------------
// Webhook routes
// ---------------------------------------------------------------------

#[derive(Clone)]
struct SlackRoutes {
    engine: Arc<Engine>,
    adapter: SlackAdapter,
}

impl SlackRoutes {
    async fn config_for_team(&self, team_id: &str) -> Option<ChannelConfig> {
        let row = self
            .engine
            .store()
            .find_enabled_by_platform_key(PlatformKind::Slack, team_id)
            .await
            .ok()??;
        match row.hydrate() {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(config_id = %row.id, "failed to hydrate slack config: {e}");
                None
            }
        }
    }

    fn verified(&self, config: &ChannelConfig, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(signing_secret) = config
            .credentials
            .get("signingSecret")
            .and_then(Value::as_str)
        else {
            return false;
        };
        let timestamp = header_str(headers, "x-slack-request-timestamp");
        let signature = header_str(headers, "x-slack-signature");
        verify_signature(signing_secret, timestamp, body, signature)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// v0 signature: HMAC-SHA256 over `v0:<timestamp>:<body>`, hex-encoded,
/// prefixed with `v0=`. Stale timestamps are rejected to stop replays.
fn verify_signature(signing_secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (Utc::now().timestamp() - ts).abs() > SIGNATURE_SKEW_SECS {
        return false;
    }
    let Some(provided) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

async fn events_handler(
    State(state): State<SlackRoutes>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if payload["type"].as_str() == Some("url_verification") {
        return Json(json!({"challenge": payload["challenge"]})).into_response();
    }

    let Some(team_id) = payload["team_id"].as_str() else {
        return StatusCode::OK.into_response();
    };
    let Some(config) = state.config_for_team(team_id).await else {
        debug!(team_id, "event for unknown team; dropping");
        return StatusCode::OK.into_response();
    };
    if !state.verified(&config, &headers, &body) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if payload["type"].as_str() == Some("event_callback") {
        if let Some(message) = normalize_event(&config, &payload) {
            let engine = state.engine.clone();
            let adapter = state.adapter.clone();
            tokio::spawn(async move {
                let mut message = message;
                if message.thread_id.is_some() {
                    match adapter.fetch_thread_context(&config, &message).await {
                        Ok(context) => message.thread_context = context,
                        Err(e) => debug!("thread context fetch failed: {e}"),
                    }
                }
                if let Err(e) = engine.process_message(message).await {
                    warn!("slack message processing failed: {e}");
                }
            });
        }
    }
    StatusCode::OK.into_response()
}

async fn interactions_handler(
    State(state): State<SlackRoutes>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(form) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(payload) = parse_form(form).remove("payload") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(payload) = serde_json::from_str::<Value>(&payload) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some(team_id) = payload["team"]["id"].as_str() else {
        return StatusCode::OK.into_response();
    };
    let Some(config) = state.config_for_team(team_id).await else {
        return StatusCode::OK.into_response();
    };
    if !state.verified(&config, &headers, &body) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if payload["type"].as_str() == Some("block_actions") {
        for action in payload["actions"].as_array().into_iter().flatten() {
            let action_id = action["action_id"].as_str().unwrap_or_default();
            let approved = match action_id {
                "permission_approve" => true,
                "permission_deny" => false,
                _ => continue,
            };
            let Some(permission_id) = action["value"].as_str() else {
                continue;
            };
            let delivered = permission::global().reply(permission_id, approved);
            debug!(permission_id, approved, delivered, "permission button clicked");
            let text = match (delivered, approved) {
                (true, true) => "Approved.",
                (true, false) => "Denied.",
                (false, _) => "This request already expired.",
            };
            return Json(json!({"replace_original": true, "text": text})).into_response();
        }
    }
    StatusCode::OK.into_response()
}

async fn commands_handler(
    State(state): State<SlackRoutes>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(form) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let fields = parse_form(form);
    let Some(team_id) = fields.get("team_id") else {
        return StatusCode::OK.into_response();
    };
    let Some(config) = state.config_for_team(team_id).await else {
        return StatusCode::OK.into_response();
    };
    if !state.verified(&config, &headers, &body) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let text = fields.get("text").map(String::as_str).unwrap_or_default();
    let command = commands::parse(text);
    let message = synthetic_command_message(&config, &fields);
    let reply = match commands::handle(&state.engine, &config, &message, command).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("slash command failed: {e}");
            "Command failed; check the gateway logs.".to_string()
        }
    };
    Json(json!({"response_type": "ephemeral", "text": reply})).into_response()
}

/// Synthetic message for the slash-command path. The `raw` bag carries the
/// response url so `send_response` targets it instead of a channel.
fn synthetic_command_message(
    config: &ChannelConfig,
    fields: &HashMap<String, String>,
) -> NormalizedMessage {
    let get = |key: &str| fields.get(key).cloned().unwrap_or_default();
    NormalizedMessage {
        external_id: get("trigger_id"),
        platform: PlatformKind::Slack,
        config_id: config.id.clone(),
        chat_type: ChatType::Dm,
        content: get("text"),
        attachments: Vec::new(),
        user: PlatformUser {
            id: get("user_id"),
            name: get("user_name"),
            avatar: None,
        },
        thread_id: None,
        group_id: None,
        mentioned: true,
        thread_context: Vec::new(),
        overrides: Default::default(),
        raw: json!({
            "channel": get("channel_id"),
            "responseUrl": get("response_url"),
        }),
    }
}

/// Decode an `application/x-www-form-urlencoded` body.
fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value_spaced = value.replace('+', " ");
            let value = urlencoding::decode(&value_spaced).ok()?;
            Some((key.to_string(), value.into_owned()))
        })
        .collect()
}

/// Build a NormalizedMessage from an `event_callback` payload. Returns
/// `None` for events the gateway must not answer: bot echoes, edited
/// messages, unmentioned group chatter when mentions are required, and the
/// plain-message twin of an `app_mention`.
fn normalize_event(config: &ChannelConfig, payload: &Value) -> Option<NormalizedMessage> {
    let event = &payload["event"];
    let event_type = event["type"].as_str()?;
    if !matches!(event_type, "message" | "app_mention") {
        return None;
    }
    if event["bot_id"].is_string() || event["subtype"].is_string() {
        return None;
    }

    let text = event["text"].as_str().unwrap_or_default();
    let bot_user_id = config
        .credentials
        .get("botUserId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mention_tag = format!("<@{bot_user_id}>");
    let mentioned =
        event_type == "app_mention" || (!bot_user_id.is_empty() && text.contains(&mention_tag));

    let channel = event["channel"].as_str()?;
    let chat_type = match event["channel_type"].as_str().unwrap_or_default() {
        "im" => ChatType::Dm,
        "group" | "mpim" => ChatType::Group,
        _ => ChatType::Channel,
    };

    if event_type == "message" && chat_type != ChatType::Dm {
        if mentioned {
            // The app_mention twin of this event carries it.
            return None;
        }
        if config.require_mention_in_groups() {
            return None;
        }
    }

    let content = if bot_user_id.is_empty() {
        text.trim().to_string()
    } else {
        text.replace(&mention_tag, "").trim().to_string()
    };

    let attachments = event["files"]
        .as_array()
        .map(|files| {
            files
                .iter()
                .filter_map(|file| {
                    let url = file["url_private"].as_str()?;
                    let mime = file["mimetype"].as_str().unwrap_or_default();
                    let kind = match mime.split('/').next().unwrap_or_default() {
                        "image" => AttachmentKind::Image,
                        "audio" => AttachmentKind::Audio,
                        "video" => AttachmentKind::Video,
                        _ => AttachmentKind::File,
                    };
                    Some(Attachment {
                        kind,
                        url: url.to_string(),
                        mime_type: (!mime.is_empty()).then(|| mime.to_string()),
                        name: file["name"].as_str().unwrap_or("file").to_string(),
                        size: file["size"].as_u64(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let ts = event["ts"].as_str().unwrap_or_default();
    let user_id = event["user"].as_str()?;
    Some(NormalizedMessage {
        external_id: ts.to_string(),
        platform: PlatformKind::Slack,
        config_id: config.id.clone(),
        chat_type,
        content,
        attachments,
        user: PlatformUser {
            id: user_id.to_string(),
            name: event["username"]
                .as_str()
                .unwrap_or(user_id)
                .to_string(),
            avatar: None,
        },
        thread_id: event["thread_ts"].as_str().map(str::to_string),
        group_id: (chat_type != ChatType::Dm).then(|| channel.to_string()),
        mentioned,
        thread_context: Vec::new(),
        overrides: Default::default(),
        raw: json!({
            "channel": channel,
            "ts": ts,
            "thread_ts": event["thread_ts"],
        }),
    })
}
