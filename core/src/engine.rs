// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! End-to-end per-message orchestration.
//!
//! `process_message` is the canonical entry from any adapter: config lookup,
//! hydration, rate limiting, then the gated pipeline. The pipeline itself
//! (`run_pipeline`) resolves a session, streams the prompt, mediates
//! permission prompts, delivers the response and any produced files, reacts,
//! and writes the audit rows. Errors fail locally: the caller always gets a
//! clean return, the user gets an error reaction.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use courier_protocol::AgentResponse;
use courier_protocol::ChannelConfig;
use courier_protocol::FileOutput;
use courier_protocol::NormalizedMessage;
use courier_protocol::PlatformKind;
use courier_protocol::StreamEvent;
use futures::StreamExt;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::adapter::Adapter;
use crate::agent::AgentClient;
use crate::agent::FilePart;
use crate::bridge;
use crate::error::CourierErr;
use crate::error::Result;
use crate::flags::COURIER_AGENT_URL;
use crate::message_log::MessageDirection;
use crate::message_log::MessageLogEntry;
use crate::permission::DEFAULT_PERMISSION_TIMEOUT;
use crate::rate_limiter::RateDecision;
use crate::rate_limiter::RateLimiter;
use crate::readiness_queue::DEFAULT_QUEUE_KEY;
use crate::readiness_queue::QueueProcessor;
use crate::readiness_queue::QueueTiming;
use crate::readiness_queue::ReadinessQueue;
use crate::session_registry::DEFAULT_SESSION_IDLE_TTL;
use crate::session_registry::SessionRegistry;
use crate::store::ConfigStore;

/// Terse formatting directive for platforms that render heavy markdown
/// poorly.
const CHAT_FORMATTING_DIRECTIVE: &str =
    "Keep replies short and chat-friendly: plain sentences, minimal markdown, no heading blocks.";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub agent_base_url: String,
    pub permission_timeout: Duration,
    pub session_idle_ttl: Duration,
    pub rate_limit_window: Duration,
    pub queue_timing: QueueTiming,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_base_url: COURIER_AGENT_URL.to_string(),
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            session_idle_ttl: DEFAULT_SESSION_IDLE_TTL,
            rate_limit_window: Duration::from_secs(60),
            queue_timing: QueueTiming::default(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ConfigStore>,
    adapters: RwLock<HashMap<PlatformKind, Arc<dyn Adapter>>>,
    rate_limiter: RateLimiter,
    sessions: SessionRegistry,
    queue: ReadinessQueue,
    http: reqwest::Client,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Engine>| {
            let processor: Weak<dyn QueueProcessor> = weak.clone();
            Engine {
                rate_limiter: RateLimiter::with_window(config.rate_limit_window),
                sessions: SessionRegistry::new(config.session_idle_ttl),
                queue: ReadinessQueue::new(config.queue_timing, processor),
                adapters: RwLock::new(HashMap::new()),
                http: reqwest::Client::new(),
                store,
                config,
            }
        })
    }

    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.write().unwrap();
        adapters.insert(adapter.kind(), adapter);
    }

    pub fn adapter_for(&self, kind: PlatformKind) -> Option<Arc<dyn Adapter>> {
        let adapters = self.adapters.read().unwrap();
        adapters.get(&kind).cloned()
    }

    /// Mount every registered adapter's webhook routes.
    pub fn register_all_routes(self: Arc<Self>, mut router: Router) -> Router {
        let adapters: Vec<Arc<dyn Adapter>> = {
            let adapters = self.adapters.read().unwrap();
            adapters.values().cloned().collect()
        };
        for adapter in adapters {
            router = adapter.register_routes(router, self.clone());
        }
        router
    }

    /// A client pointed at the configured agent server, sharing the
    /// engine's connection pool.
    pub fn agent_client(&self) -> AgentClient {
        AgentClient::with_client(&self.config.agent_base_url, self.http.clone())
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn queue(&self) -> &ReadinessQueue {
        &self.queue
    }

    /// Periodic bucket/session eviction. The task exits when the engine is
    /// dropped.
    pub fn spawn_maintenance(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.rate_limiter.cleanup();
                engine.sessions.cleanup();
            }
        })
    }

    /// Canonical entry from any adapter. Unknown, disabled, unparseable, or
    /// rate-limited messages are dropped here with a warning and no side
    /// effects.
    pub async fn process_message(&self, message: NormalizedMessage) -> Result<()> {
        let Some(row) = self.store.find_enabled_by_id(&message.config_id).await? else {
            warn!(
                config_id = %message.config_id,
                "dropping message for unknown or disabled config"
            );
            return Ok(());
        };
        let config = match row.hydrate() {
            Ok(config) => config,
            Err(e) => {
                warn!(config_id = %row.id, "failed to hydrate config: {e}");
                return Ok(());
            }
        };

        if let RateDecision::Limited { retry_after_ms } =
            self.rate_limiter.check(&config.id, &message.user.id)
        {
            warn!(
                config_id = %config.id,
                user_id = %message.user.id,
                retry_after_ms,
                "rate limited; dropping message"
            );
            return Ok(());
        }

        self.process_inner(message, config).await
    }

    /// Gated pipeline for an admitted message. The typing indicator release
    /// fires on every exit path, and any pipeline error surfaces to the user
    /// as an error reaction, never as a thrown webhook error.
    pub async fn process_inner(
        &self,
        message: NormalizedMessage,
        config: ChannelConfig,
    ) -> Result<()> {
        let Some(adapter) = self.adapter_for(config.platform) else {
            error!(platform = %config.platform, "no adapter registered");
            return Ok(());
        };
        let client = self.agent_client();

        self.store
            .append_message(log_entry(
                MessageDirection::Inbound,
                &config,
                &message,
                &message.content,
                None,
            ))
            .await;

        let typing = adapter.capabilities().supports_typing_indicator;
        if typing {
            let adapter = adapter.clone();
            let config = config.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.send_typing_indicator(&config, &message).await {
                    debug!("typing indicator failed: {e}");
                }
            });
        }

        let result = if client.is_ready().await {
            self.run_pipeline(&message, &config, adapter.clone(), &client)
                .await
        } else {
            debug!(config_id = %config.id, "agent server not ready; queueing message");
            let rx = self.queue.enqueue(
                DEFAULT_QUEUE_KEY,
                message.clone(),
                config.clone(),
                client.clone(),
            );
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(CourierErr::Stream(
                    "readiness queue dropped the message".to_string(),
                )),
            }
        };

        if typing {
            if let Err(e) = adapter.remove_typing_indicator(&config, &message).await {
                debug!("failed to clear typing indicator: {e}");
            }
        }

        if let Err(e) = &result {
            warn!(
                config_id = %config.id,
                external_id = %message.external_id,
                "message pipeline failed: {e}"
            );
            if adapter.supports_reactions() {
                let adapter = adapter.clone();
                let config = config.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    if let Err(e) = adapter.react_error(&config, &message).await {
                        debug!("error reaction failed: {e}");
                    }
                });
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        message: &NormalizedMessage,
        config: &ChannelConfig,
        adapter: Arc<dyn Adapter>,
        client: &AgentClient,
    ) -> Result<()> {
        let started = Instant::now();

        let agent_name = message
            .overrides
            .agent_name
            .clone()
            .or_else(|| config.agent_name.clone());
        let session_id = self
            .sessions
            .resolve(config, message, client, agent_name.as_deref())
            .await?;

        let prompt = build_prompt(config, message);
        let model = message
            .overrides
            .model
            .clone()
            .or_else(|| config.pinned_model());

        let file_parts: Vec<FilePart> = message
            .attachments
            .iter()
            .filter(|a| !a.url.is_empty())
            .map(|a| FilePart {
                mime: a
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                url: a.url.clone(),
                filename: a.name.clone(),
            })
            .collect();

        // Snapshot the workspace so the post-stream diff only surfaces files
        // this prompt produced. Non-fatal: a failed snapshot means a noisier
        // diff, not a failed message.
        let files_before: HashSet<String> = match client.modified_files().await {
            Ok(files) => files.into_iter().map(|f| f.path).collect(),
            Err(e) => {
                debug!("workspace pre-snapshot failed: {e}");
                HashSet::new()
            }
        };

        let mut stream = client
            .prompt_stream(
                &session_id,
                &prompt,
                agent_name.as_deref(),
                model.as_ref(),
                file_parts,
            )
            .await?;

        let mut response_text = String::new();
        let mut collected: Vec<FileOutput> = Vec::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Text { data } => response_text.push_str(&data),
                StreamEvent::File {
                    name,
                    url,
                    mime_type,
                } => collected.push(FileOutput {
                    name,
                    url,
                    mime_type,
                    content: None,
                }),
                StreamEvent::Permission(request) => {
                    if adapter.supports_permission_requests() {
                        bridge::handle_permission_event(
                            config,
                            message,
                            &request,
                            adapter.as_ref(),
                            client,
                            self.config.permission_timeout,
                        )
                        .await;
                    } else {
                        debug!(
                            permission_id = %request.id,
                            "adapter cannot prompt; ignoring permission request"
                        );
                    }
                }
                StreamEvent::Error { data } => return Err(CourierErr::Agent(data)),
                StreamEvent::Busy => {}
                StreamEvent::Done => break,
            }
        }
        drop(stream);

        let response = AgentResponse {
            content: response_text.clone(),
            session_id: session_id.clone(),
            truncated: false,
            model_name: model
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "default".to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(e) = adapter.send_response(config, message, &response).await {
            warn!(config_id = %config.id, "send_response failed: {e}");
        }

        let mut had_files = false;
        let collected_names: HashSet<String> = collected.iter().map(|f| f.name.clone()).collect();
        if adapter.capabilities().supports_attachments {
            // Files collected from the stream are url-only; materialize them.
            let mut deliverable: Vec<FileOutput> = Vec::new();
            for mut file in collected {
                match client.download_file(&file.url).await {
                    Ok(Some(content)) => {
                        file.content = Some(content);
                        deliverable.push(file);
                    }
                    Ok(None) => debug!(name = %file.name, "dropping streamed file with no content"),
                    Err(e) => debug!(name = %file.name, "streamed file download failed: {e}"),
                }
            }
            if !deliverable.is_empty() {
                had_files = true;
                if let Err(e) = adapter.send_files(config, message, &deliverable).await {
                    warn!(config_id = %config.id, "send_files failed: {e}");
                }
            }

            // Second pass: anything new in the workspace that the stream did
            // not already hand over.
            match client.modified_files().await {
                Ok(after) => {
                    let mut diffed: Vec<FileOutput> = Vec::new();
                    for file in after {
                        if files_before.contains(&file.path)
                            || collected_names.contains(&file.name)
                        {
                            continue;
                        }
                        match client.download_file_by_path(&file.path).await {
                            Ok(Some(content)) => {
                                let mime_type = mime_guess::from_path(&file.name)
                                    .first()
                                    .map(|m| m.essence_str().to_string());
                                diffed.push(FileOutput {
                                    name: file.name,
                                    url: file.path,
                                    mime_type,
                                    content: Some(content),
                                });
                            }
                            Ok(None) => debug!(path = %file.path, "diffed file vanished"),
                            Err(e) => debug!(path = %file.path, "diffed file download failed: {e}"),
                        }
                    }
                    if !diffed.is_empty() {
                        had_files = true;
                        if let Err(e) = adapter.send_files(config, message, &diffed).await {
                            warn!(config_id = %config.id, "send_files failed: {e}");
                        }
                    }
                }
                Err(e) => debug!("workspace diff failed: {e}"),
            }
        }

        if adapter.supports_reactions() {
            if let Err(e) = adapter.react_complete(config, message).await {
                debug!("completion reaction failed: {e}");
            }
            if had_files {
                if let Err(e) = adapter.react_files_changed(config, message).await {
                    debug!("files-changed reaction failed: {e}");
                }
            }
        }

        self.store
            .append_message(log_entry(
                MessageDirection::Outbound,
                config,
                message,
                &response_text,
                Some(session_id),
            ))
            .await;

        Ok(())
    }
}

#[async_trait]
impl QueueProcessor for Engine {
    async fn process(&self, message: NormalizedMessage, config: ChannelConfig) -> Result<()> {
        let Some(adapter) = self.adapter_for(config.platform) else {
            return Err(CourierErr::AdapterNotFound(config.platform.to_string()));
        };
        let client = self.agent_client();
        self.run_pipeline(&message, &config, adapter, &client).await
    }
}

fn log_entry(
    direction: MessageDirection,
    config: &ChannelConfig,
    message: &NormalizedMessage,
    content: &str,
    session_id: Option<String>,
) -> MessageLogEntry {
    MessageLogEntry {
        direction,
        config_id: config.id.clone(),
        external_id: message.external_id.clone(),
        content: content.to_string(),
        user_id: message.user.id.clone(),
        user_name: message.user.name.clone(),
        session_id,
        ts: Utc::now().timestamp().max(0) as u64,
    }
}

/// Assemble the prompt sections in their fixed order, joined by blank
/// lines: system prompt, channel-specific instructions, formatting
/// directive, metadata line, thread context, then the user's message.
fn build_prompt(config: &ChannelConfig, message: &NormalizedMessage) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(system_prompt) = &config.system_prompt {
        if !system_prompt.is_empty() {
            sections.push(system_prompt.clone());
        }
    }

    if let Some(group_id) = &message.group_id {
        if let Some(channel_prompt) = config.channel_prompt(group_id) {
            sections.push(format!("[Channel-specific instructions]\n{channel_prompt}"));
        }
    }

    if matches!(config.platform, PlatformKind::Slack | PlatformKind::Telegram) {
        sections.push(CHAT_FORMATTING_DIRECTIVE.to_string());
    }

    sections.push(format!(
        "[Channel: {} | Chat: {} | User: {}]",
        config.name, message.chat_type, message.user.name
    ));

    if !message.thread_context.is_empty() {
        let mut block = String::from("[Thread context]");
        for entry in &message.thread_context {
            block.push('\n');
            if entry.is_bot {
                block.push_str(&format!("Assistant: {}", entry.text));
            } else {
                block.push_str(&format!("{}: {}", entry.sender, entry.text));
            }
        }
        sections.push(block);
    }

    sections.push(message.content.clone());
    sections.join("\n\n")
}
