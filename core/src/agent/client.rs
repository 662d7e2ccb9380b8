use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use courier_protocol::ModelRef;
use courier_protocol::StreamEvent;
use futures::Stream;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::agent::sse::process_agent_sse;
use crate::error::CourierErr;
use crate::error::Result;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const CREATE_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const PROMPT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const FILE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MODIFIED_FILES_TIMEOUT: Duration = Duration::from_secs(10);
const PERMISSION_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Workspace prefixes the agent server uses for absolute file paths; they
/// are stripped before hitting the by-path download endpoint.
const WORKSPACE_PREFIXES: &[&str] = &["/workspace/", "/home/daytona/", "/home/user/"];

/// File extensions considered deliverable output. Everything else the
/// workspace diff reports (sources, lockfiles, caches) stays put.
const OUTPUT_EXTENSIONS: &[&str] = &[
    "md", "txt", "pdf", "html", "csv", "json", "xml", "doc", "docx", "xlsx", "pptx", "png", "jpg",
    "jpeg", "gif", "svg", "mp3", "mp4", "wav",
];

/// An inbound attachment forwarded to the agent as a prompt part.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub mime: String,
    pub url: String,
    pub filename: String,
}

/// One entry from the workspace modified-files listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedFile {
    pub name: String,
    pub path: String,
}

/// HTTP + SSE client for one agent server base URL. Cheap to clone; clones
/// share the underlying connection pool.
#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Health probe. Any transport failure reads as "not ready".
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/global/health", self.base_url);
        match self.http.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health probe failed: {e}");
                false
            }
        }
    }

    /// Create a fresh upstream session, optionally pinned to a named agent.
    pub async fn create_session(&self, agent_name: Option<&str>) -> Result<String> {
        let mut body = serde_json::Map::new();
        if let Some(agent) = agent_name {
            body.insert("agent".to_string(), json!(agent));
        }
        let resp = self
            .http
            .post(format!("{}/session", self.base_url))
            .timeout(CREATE_SESSION_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }
        let value: Value = resp.json().await?;
        let session_id = value
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| value.get("sessionID").and_then(Value::as_str))
            .or_else(|| value.as_str());
        session_id
            .map(str::to_string)
            .ok_or_else(|| CourierErr::Protocol("session create returned no id".to_string()))
    }

    /// Open the upstream event stream and issue the prompt.
    ///
    /// Two-phase: the SSE GET completes its handshake first so the prompt's
    /// own lifecycle events are observable, then the prompt POST is issued
    /// concurrently with the read loop. Dropping the returned stream aborts
    /// both; the reader enforces the overall deadline.
    pub async fn prompt_stream(
        &self,
        session_id: &str,
        content: &str,
        agent_name: Option<&str>,
        model: Option<&ModelRef>,
        file_parts: Vec<FilePart>,
    ) -> Result<PromptStream> {
        let resp = self
            .http
            .get(format!("{}/event", self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }

        let deadline = tokio::time::Instant::now() + PROMPT_STREAM_TIMEOUT;
        let (tx_event, rx_event) = mpsc::channel::<Result<StreamEvent>>(16);

        let byte_stream = resp.bytes_stream().map_err(CourierErr::Reqwest);
        let sse_task = tokio::spawn(process_agent_sse(
            byte_stream,
            session_id.to_string(),
            tx_event.clone(),
            deadline,
        ));

        let mut parts = vec![json!({"type": "text", "text": content})];
        for part in &file_parts {
            parts.push(json!({
                "type": "file",
                "mime": part.mime,
                "url": part.url,
                "filename": part.filename,
            }));
        }
        let mut body = json!({ "parts": parts });
        if let Some(agent) = agent_name {
            body["agent"] = json!(agent);
        }
        if let Some(model) = model {
            body["model"] = json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }

        let prompt_req = self
            .http
            .post(format!(
                "{}/session/{}/prompt_async",
                self.base_url, session_id
            ))
            .timeout(PROMPT_STREAM_TIMEOUT)
            .json(&body);
        let post_task = tokio::spawn(async move {
            match prompt_req.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let _ = tx_event
                        .send(Err(CourierErr::UnexpectedStatus(status, body)))
                        .await;
                }
                Err(e) => {
                    let _ = tx_event.send(Err(e.into())).await;
                }
            }
        });

        Ok(PromptStream {
            rx_event,
            sse_task,
            post_task,
        })
    }

    /// Deliver the user's permission decision. Errors are logged and
    /// swallowed; the decision has already been applied locally.
    pub async fn reply_permission(&self, id: &str, approved: bool) {
        let url = format!("{}/permission/{}/reply", self.base_url, id);
        let body = json!({ "approved": approved });
        match self
            .http
            .post(url)
            .timeout(PERMISSION_REPLY_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(id, status = %resp.status(), "permission reply rejected by upstream");
            }
            Err(e) => warn!(id, "failed to deliver permission reply: {e}"),
        }
    }

    /// Fetch a streamed file reference. Absolute URLs are fetched directly;
    /// anything else is treated as a workspace path, with a trailing-filename
    /// retry when the full path misses.
    pub async fn download_file(&self, url: &str) -> Result<Option<Vec<u8>>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let resp = self
                .http
                .get(url)
                .timeout(FILE_DOWNLOAD_TIMEOUT)
                .send()
                .await?;
            if !resp.status().is_success() {
                debug!(url, status = %resp.status(), "file download miss");
                return Ok(None);
            }
            return Ok(Some(resp.bytes().await?.to_vec()));
        }

        let mut path = url;
        for prefix in WORKSPACE_PREFIXES {
            if let Some(rest) = path.strip_prefix(prefix) {
                path = rest;
                break;
            }
        }
        let path = path.trim_start_matches('/');
        if let Some(content) = self.download_file_by_path(path).await? {
            return Ok(Some(content));
        }
        match path.rsplit('/').next() {
            Some(name) if name != path => self.download_file_by_path(name).await,
            _ => Ok(None),
        }
    }

    /// Fetch a workspace file by path. A 404 is a miss, not an error.
    pub async fn download_file_by_path(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .http
            .get(format!("{}/file/content", self.base_url))
            .query(&[("path", path)])
            .timeout(FILE_DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            debug!(path, status = %resp.status(), "by-path download miss");
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct FileContent {
            content: String,
            encoding: Option<String>,
        }

        let text = resp.text().await?;
        match serde_json::from_str::<FileContent>(&text) {
            Ok(fc) if fc.encoding.as_deref() == Some("base64") => {
                match BASE64_STANDARD.decode(fc.content.as_bytes()) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) => {
                        warn!(path, "invalid base64 file content: {e}");
                        Ok(None)
                    }
                }
            }
            Ok(fc) => Ok(Some(fc.content.into_bytes())),
            Err(_) => Ok(Some(text.into_bytes())),
        }
    }

    /// List workspace files the agent touched, filtered down to deliverable
    /// output types. Accepts either an array of entries or a path→status map.
    pub async fn modified_files(&self) -> Result<Vec<ModifiedFile>> {
        let resp = self
            .http
            .get(format!("{}/file/status", self.base_url))
            .timeout(MODIFIED_FILES_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }
        let value: Value = resp.json().await?;

        let paths: Vec<String> = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(path) => Some(path),
                    Value::Object(entry) => entry
                        .get("path")
                        .or_else(|| entry.get("file"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .collect(),
            Value::Object(entries) => entries.into_iter().map(|(path, _)| path).collect(),
            _ => Vec::new(),
        };

        Ok(paths
            .into_iter()
            .filter(|path| is_output_file(path))
            .map(|path| ModifiedFile {
                name: trailing_file_name(&path),
                path,
            })
            .collect())
    }

    pub async fn list_providers(&self) -> Result<Vec<Value>> {
        let value = self.get_json("/provider").await?;
        Ok(normalize_list(value, "providers"))
    }

    pub async fn list_agents(&self) -> Result<Vec<Value>> {
        let value = self.get_json("/agent").await?;
        Ok(normalize_list(value, "agents"))
    }

    pub async fn session_diff(&self, session_id: &str) -> Result<Value> {
        self.get_json(&format!("/session/{session_id}/diff")).await
    }

    pub async fn share_session(&self, session_id: &str) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/session/{}/share", self.base_url, session_id))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/session/{}/abort", self.base_url, session_id))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }
        Ok(())
    }

    async fn get_json(&self, route: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, route))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierErr::UnexpectedStatus(status, body));
        }
        Ok(resp.json().await?)
    }
}

/// The typed event sequence for one prompt. Dropping it tears down both the
/// SSE read and the prompt POST.
pub struct PromptStream {
    rx_event: mpsc::Receiver<Result<StreamEvent>>,
    sse_task: JoinHandle<()>,
    post_task: JoinHandle<()>,
}

impl Stream for PromptStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

impl Drop for PromptStream {
    fn drop(&mut self) {
        self.sse_task.abort();
        self.post_task.abort();
    }
}

fn normalize_list(value: Value, key: &str) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key).or_else(|| map.remove("list")) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => map.into_iter().map(|(_, v)| v).collect(),
        },
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn trailing_file_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('?').next().unwrap_or(name).to_string()
}

fn is_output_file(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments
        .iter()
        .any(|segment| segment.starts_with('.') || *segment == "node_modules")
    {
        return false;
    }
    let Some(name) = segments.last() else {
        return false;
    };
    let Some((_, extension)) = name.rsplit_once('.') else {
        return false;
    };
    OUTPUT_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}
