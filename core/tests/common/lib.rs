#![allow(clippy::unwrap_used)]

//! Shared plumbing for the integration tests: a recording adapter, an
//! in-memory config store, SSE body builders, and mock agent-server mounts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use courier_core::adapter::Adapter;
use courier_core::adapter::AdapterCapabilities;
use courier_core::adapter::ConnectionType;
use courier_core::adapter::CredentialCheck;
use courier_core::engine::Engine;
use courier_core::engine::EngineConfig;
use courier_core::error::CourierErr;
use courier_core::error::Result;
use courier_core::message_log::MessageLogEntry;
use courier_core::readiness_queue::QueueTiming;
use courier_core::store::ConfigPatch;
use courier_core::store::ConfigRow;
use courier_core::store::ConfigStore;
use courier_protocol::AgentResponse;
use courier_protocol::ChannelConfig;
use courier_protocol::ChatType;
use courier_protocol::FileOutput;
use courier_protocol::NormalizedMessage;
use courier_protocol::PermissionRequest;
use courier_protocol::PlatformKind;
use courier_protocol::PlatformUser;
use courier_protocol::SessionStrategy;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

// ---------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------

pub fn config_row(id: &str) -> ConfigRow {
    ConfigRow {
        id: id.to_string(),
        platform: PlatformKind::Slack,
        name: format!("config {id}"),
        enabled: true,
        credentials: String::new(),
        platform_config: String::new(),
        metadata: String::new(),
        session_strategy: SessionStrategy::PerUser,
        system_prompt: None,
        agent_name: None,
        platform_key: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn dm_message(config_id: &str, user_id: &str, content: &str) -> NormalizedMessage {
    NormalizedMessage {
        external_id: format!("ext-{user_id}-{content_len}", content_len = content.len()),
        platform: PlatformKind::Slack,
        config_id: config_id.to_string(),
        chat_type: ChatType::Dm,
        content: content.to_string(),
        attachments: Vec::new(),
        user: PlatformUser {
            id: user_id.to_string(),
            name: "Alice".to_string(),
            avatar: None,
        },
        thread_id: None,
        group_id: None,
        mentioned: false,
        thread_context: Vec::new(),
        overrides: Default::default(),
        raw: serde_json::Value::Null,
    }
}

/// Engine config with compressed timeouts, pointed at a mock agent server.
pub fn test_engine_config(base_url: &str) -> EngineConfig {
    EngineConfig {
        agent_base_url: base_url.to_string(),
        permission_timeout: Duration::from_millis(500),
        session_idle_ttl: Duration::from_secs(3600),
        rate_limit_window: Duration::from_secs(60),
        queue_timing: QueueTiming {
            poll_interval: Duration::from_millis(20),
            ready_deadline: Duration::from_secs(5),
        },
    }
}

// ---------------------------------------------------------------------
// SSE bodies
// ---------------------------------------------------------------------

/// One `data: <json>` line per event, the upstream's framing.
pub fn sse_body(events: &[serde_json::Value]) -> String {
    events.iter().map(|e| format!("data: {e}\n")).collect()
}

/// busy → text deltas → idle, all correlated to `session_id`.
pub fn simple_exchange(session_id: &str, deltas: &[&str]) -> String {
    let mut events = vec![serde_json::json!({
        "type": "session.status",
        "properties": {"sessionID": session_id, "status": {"type": "busy"}}
    })];
    for delta in deltas {
        events.push(serde_json::json!({
            "type": "message.part.delta",
            "properties": {"sessionID": session_id, "delta": delta}
        }));
    }
    events.push(serde_json::json!({
        "type": "session.idle",
        "properties": {"sessionID": session_id}
    }));
    sse_body(&events)
}

// ---------------------------------------------------------------------
// Mock agent server mounts
// ---------------------------------------------------------------------

pub async fn mount_health_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/global/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

pub async fn mount_create_session(server: &MockServer, session_id: &str) {
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": session_id})),
        )
        .mount(server)
        .await;
}

pub async fn mount_prompt_async(server: &MockServer, session_id: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/session/{session_id}/prompt_async")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
}

pub async fn mount_event_stream(server: &MockServer, body: String) {
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(server)
        .await;
}

pub async fn mount_empty_file_status(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/file/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(server)
        .await;
}

/// Everything a happy-path exchange needs: health, session create, prompt
/// accept, the given event stream, and an empty workspace.
pub async fn mount_basic_agent(server: &MockServer, session_id: &str, stream_body: String) {
    mount_health_ok(server).await;
    mount_create_session(server, session_id).await;
    mount_prompt_async(server, session_id).await;
    mount_event_stream(server, stream_body).await;
    mount_empty_file_status(server).await;
}

// ---------------------------------------------------------------------
// In-memory config store
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemStore {
    rows: Mutex<HashMap<String, ConfigRow>>,
    log: Mutex<Vec<MessageLogEntry>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(row: ConfigRow) -> Arc<Self> {
        let store = Self::new();
        store.insert(row);
        Arc::new(store)
    }

    pub fn insert(&self, row: ConfigRow) {
        self.rows.lock().unwrap().insert(row.id.clone(), row);
    }

    pub fn log_entries(&self) -> Vec<MessageLogEntry> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn find_enabled_by_id(&self, id: &str) -> Result<Option<ConfigRow>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(id).filter(|row| row.enabled).cloned())
    }

    async fn find_enabled_by_platform_key(
        &self,
        platform: PlatformKind,
        key: &str,
    ) -> Result<Option<ConfigRow>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .find(|row| {
                row.enabled && row.platform == platform && row.platform_key.as_deref() == Some(key)
            })
            .cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ConfigRow>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|row| row.enabled).cloned().collect())
    }

    async fn update(&self, id: &str, patch: ConfigPatch) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
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
        Ok(())
    }

    async fn append_message(&self, entry: MessageLogEntry) {
        self.log.lock().unwrap().push(entry);
    }
}

// ---------------------------------------------------------------------
// Recording adapter
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    SendResponse(AgentResponse),
    SendFiles(Vec<String>),
    SendPermissionRequest(PermissionRequest),
    Typing,
    RemoveTyping,
    ReactComplete,
    ReactError,
    ReactFilesChanged,
}

/// Slack-shaped adapter that records every engine call.
pub struct RecordingAdapter {
    calls: Mutex<Vec<AdapterCall>>,
    fail_permission_send: AtomicBool,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_permission_send: AtomicBool::new(false),
        })
    }

    pub fn fail_permission_sends(&self) {
        self.fail_permission_send.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<AgentResponse> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdapterCall::SendResponse(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&AdapterCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Adapter for RecordingAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Slack
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            text_chunk_limit: 4000,
            supports_rich_text: true,
            supports_editing: false,
            supports_typing_indicator: true,
            supports_attachments: true,
            connection_type: ConnectionType::Webhook,
        }
    }

    fn register_routes(&self, router: Router, _engine: Arc<Engine>) -> Router {
        router
    }

    async fn send_response(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
        response: &AgentResponse,
    ) -> Result<()> {
        self.record(AdapterCall::SendResponse(response.clone()));
        Ok(())
    }

    async fn validate_credentials(
        &self,
        _credentials: &mut serde_json::Map<String, serde_json::Value>,
    ) -> CredentialCheck {
        CredentialCheck::ok()
    }

    async fn send_typing_indicator(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        self.record(AdapterCall::Typing);
        Ok(())
    }

    async fn remove_typing_indicator(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        self.record(AdapterCall::RemoveTyping);
        Ok(())
    }

    fn supports_reactions(&self) -> bool {
        true
    }

    async fn react_complete(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        self.record(AdapterCall::ReactComplete);
        Ok(())
    }

    async fn react_error(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        self.record(AdapterCall::ReactError);
        Ok(())
    }

    async fn react_files_changed(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        self.record(AdapterCall::ReactFilesChanged);
        Ok(())
    }

    async fn send_files(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
        files: &[FileOutput],
    ) -> Result<()> {
        self.record(AdapterCall::SendFiles(
            files.iter().map(|f| f.name.clone()).collect(),
        ));
        Ok(())
    }

    fn supports_permission_requests(&self) -> bool {
        true
    }

    async fn send_permission_request(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
        permission: &PermissionRequest,
    ) -> Result<()> {
        if self.fail_permission_send.load(Ordering::SeqCst) {
            return Err(CourierErr::Adapter("permission delivery down".to_string()));
        }
        self.record(AdapterCall::SendPermissionRequest(permission.clone()));
        Ok(())
    }
}

/// Wait until `predicate` holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
