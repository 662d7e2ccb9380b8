use serde::Deserialize;
use serde::Serialize;

/// Final envelope the engine delivers to an adapter once the stream ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    pub session_id: String,
    pub truncated: bool,
    pub model_name: String,
    pub duration_ms: u64,
}

/// A file produced during streaming or discovered by the workspace diff.
///
/// Starts out as a reference (`content: None`) and is materialized by the
/// engine before `send_files`; entries that cannot be downloaded are
/// dropped rather than delivered empty.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutput {
    pub name: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub content: Option<Vec<u8>>,
}

impl FileOutput {
    pub fn reference(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            mime_type: None,
            content: None,
        }
    }
}

/// An agent-originated prompt requiring a yes/no from the end user before
/// the agent proceeds. The id is chosen by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool: String,
    pub description: String,
}

/// Typed event sequence the stream reader produces from the upstream SSE
/// feed, in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text {
        data: String,
    },
    File {
        name: String,
        url: String,
        mime_type: Option<String>,
    },
    Permission(PermissionRequest),
    Busy,
    Done,
    Error {
        data: String,
    },
}
