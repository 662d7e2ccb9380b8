//! Parses the agent server's event stream into typed [`StreamEvent`]s.
//!
//! The upstream frames one JSON object per `data: <json>` line, so framing
//! is done by hand: bytes accumulate in a buffer and are split on newlines.
//! Lines without a `data:` prefix and lines whose suffix is not valid JSON
//! are skipped silently, as are events for other sessions.

use std::collections::HashSet;

use bytes::Bytes;
use courier_protocol::PermissionRequest;
use courier_protocol::StreamEvent;
use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::trace;

use crate::error::CourierErr;
use crate::error::Result;

/// Tool names whose completed output is surfaced to the user as files.
const SHOW_TOOLS: &[&str] = &["show", "show_user", "show-user"];

pub(crate) async fn process_agent_sse<S>(
    mut stream: S,
    session_id: String,
    tx_event: mpsc::Sender<Result<StreamEvent>>,
    deadline: tokio::time::Instant,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut parser = SseParser::new(session_id);
    let mut buffer: Vec<u8> = Vec::new();
    let mut out: Vec<StreamEvent> = Vec::new();

    loop {
        let chunk = match timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                let _ = tx_event.send(Err(e)).await;
                return;
            }
            Ok(None) => {
                // Upstream closed; a final unterminated line may remain.
                if !buffer.is_empty() {
                    parser.handle_line(&buffer, &mut out);
                    flush(&tx_event, &mut out).await;
                }
                return;
            }
            Err(_) => {
                let _ = tx_event.send(Err(CourierErr::Timeout)).await;
                return;
            }
        };

        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let terminal = parser.handle_line(&line[..line.len() - 1], &mut out);
            if !flush(&tx_event, &mut out).await {
                return;
            }
            if terminal {
                return;
            }
        }
    }
}

async fn flush(tx_event: &mpsc::Sender<Result<StreamEvent>>, out: &mut Vec<StreamEvent>) -> bool {
    for event in out.drain(..) {
        if tx_event.send(Ok(event)).await.is_err() {
            // Consumer went away; stop reading.
            return false;
        }
    }
    true
}

/// Per-stream parser state. Events are correlated to the requested session
/// and deduplicated where the upstream repeats itself (tool-call files).
struct SseParser {
    session_id: String,
    assistant_message_ids: HashSet<String>,
    processed_tool_calls: HashSet<String>,
    saw_busy: bool,
    got_text: bool,
}

impl SseParser {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            assistant_message_ids: HashSet::new(),
            processed_tool_calls: HashSet::new(),
            saw_busy: false,
            got_text: false,
        }
    }

    /// Parse one line. Pushes resulting events into `out` and returns
    /// whether the stream is terminal after this line.
    fn handle_line(&mut self, line: &[u8], out: &mut Vec<StreamEvent>) -> bool {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end();
        let Some(payload) = line.strip_prefix("data:") else {
            return false;
        };
        let data: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => return false,
        };
        self.handle_event(&data, out)
    }

    fn handle_event(&mut self, data: &Value, out: &mut Vec<StreamEvent>) -> bool {
        let evt = data.get("type").and_then(Value::as_str).unwrap_or_default();
        let props = data.get("properties").unwrap_or(&Value::Null);

        if let Some(event_session) = event_session_id(props) {
            if event_session != self.session_id {
                return false;
            }
        }

        match evt {
            "message.updated" => {
                let info = &props["info"];
                if info["role"].as_str() == Some("assistant") {
                    if let Some(id) = info["id"].as_str() {
                        self.assistant_message_ids.insert(id.to_string());
                    }
                }
            }
            "message.part.delta" => {
                if let Some(delta) = props["delta"].as_str() {
                    if !delta.is_empty() {
                        out.push(StreamEvent::Text {
                            data: delta.to_string(),
                        });
                        self.saw_busy = true;
                        self.got_text = true;
                    }
                }
            }
            "message.part.updated" => self.handle_part_updated(props, out),
            "permission.asked" | "permission.requested" => {
                let id = props["id"]
                    .as_str()
                    .or_else(|| props["requestID"].as_str())
                    .unwrap_or_default();
                let tool = props["tool"]
                    .as_str()
                    .or_else(|| props["toolName"].as_str())
                    .unwrap_or("unknown");
                let description = props["description"]
                    .as_str()
                    .or_else(|| props["message"].as_str())
                    .unwrap_or_default();
                out.push(StreamEvent::Permission(PermissionRequest {
                    id: id.to_string(),
                    tool: tool.to_string(),
                    description: description.to_string(),
                }));
            }
            "session.status" => {
                if props["status"]["type"].as_str() == Some("busy") {
                    out.push(StreamEvent::Busy);
                    self.saw_busy = true;
                }
            }
            "session.idle" => {
                // Idle before any activity is the steady state of a shared
                // event feed, not the end of this prompt.
                if self.saw_busy || self.got_text {
                    out.push(StreamEvent::Done);
                    return true;
                }
            }
            "session.error" => {
                let message = props["error"]["data"]["message"]
                    .as_str()
                    .unwrap_or("unknown error");
                out.push(StreamEvent::Error {
                    data: message.to_string(),
                });
                return true;
            }
            other => trace!(other, "ignoring upstream event"),
        }
        false
    }

    fn handle_part_updated(&mut self, props: &Value, out: &mut Vec<StreamEvent>) {
        let part = &props["part"];
        match part["type"].as_str().unwrap_or_default() {
            // Fallback text path for older agent versions that never emit
            // message.part.delta. Only parts of known assistant messages
            // count, and only their explicit delta field.
            "text" => {
                let message_id = part["messageID"].as_str().unwrap_or_default();
                if !self.assistant_message_ids.contains(message_id) {
                    return;
                }
                if let Some(delta) = part["delta"].as_str() {
                    if !delta.is_empty() {
                        out.push(StreamEvent::Text {
                            data: delta.to_string(),
                        });
                        self.saw_busy = true;
                        self.got_text = true;
                    }
                }
            }
            "file" => {
                out.push(StreamEvent::File {
                    name: part["filename"].as_str().unwrap_or("file").to_string(),
                    url: part["url"].as_str().unwrap_or_default().to_string(),
                    mime_type: part["mimeType"].as_str().map(str::to_string),
                });
            }
            "tool" => {
                let state = &part["state"];
                if state["status"].as_str() != Some("completed") {
                    return;
                }
                let Some(call_id) = part["callID"]
                    .as_str()
                    .or_else(|| state["callID"].as_str())
                else {
                    return;
                };
                let tool = part["tool"].as_str().unwrap_or_default();
                if !SHOW_TOOLS.contains(&tool) || self.processed_tool_calls.contains(call_id) {
                    return;
                }
                let before = out.len();
                extract_tool_files(part, out);
                if out.len() > before {
                    self.processed_tool_calls.insert(call_id.to_string());
                }
            }
            _ => {}
        }
    }
}

fn event_session_id(props: &Value) -> Option<&str> {
    props["sessionID"]
        .as_str()
        .or_else(|| props["info"]["sessionID"].as_str())
        .or_else(|| props["part"]["sessionID"].as_str())
}

/// Pull file outputs from a completed `show`-family tool call. The tool's
/// `state.output` is a JSON string of one entry or an array of entries; when
/// it yields nothing, the tool input is the fallback.
fn extract_tool_files(part: &Value, out: &mut Vec<StreamEvent>) {
    let mut candidates: Vec<Value> = Vec::new();

    if let Some(output) = part["state"]["output"].as_str() {
        match serde_json::from_str::<Value>(output) {
            Ok(Value::Array(entries)) => candidates.extend(entries),
            Ok(entry @ Value::Object(_)) => candidates.push(entry),
            _ => {}
        }
    }
    if candidates.is_empty() {
        let input = if part["state"]["input"].is_object() {
            &part["state"]["input"]
        } else {
            &part["input"]
        };
        if input.is_object() {
            candidates.push(input.clone());
        }
    }

    for entry in candidates {
        let kind = entry["type"].as_str().unwrap_or_default();
        if kind != "file" && kind != "image" {
            continue;
        }
        let file_path = entry["filePath"]
            .as_str()
            .or_else(|| entry["path"].as_str());
        let public_url = entry["publicUrl"].as_str();
        let Some(source) = file_path.or(public_url) else {
            continue;
        };
        let name = trailing_segment(source);
        let Some(url) = public_url.or(file_path) else {
            continue;
        };
        let mime_type = if kind == "image" {
            mime_guess::from_path(&name)
                .first()
                .map(|m| m.essence_str().to_string())
        } else {
            None
        };
        out.push(StreamEvent::File {
            name,
            url: url.to_string(),
            mime_type,
        });
    }
}

fn trailing_segment(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('?').next().unwrap_or(name).to_string()
}
