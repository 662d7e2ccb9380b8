//! Correlates an agent-originated permission request with the user's
//! out-of-band reply.
//!
//! The pending entry is registered before the prompt goes out so a reply
//! that races the delivery is never lost. Whatever happens — user click,
//! delivery failure, timeout — the agent is told the outcome.

use std::time::Duration;

use courier_protocol::ChannelConfig;
use courier_protocol::NormalizedMessage;
use courier_protocol::PermissionRequest;
use tracing::warn;

use crate::adapter::Adapter;
use crate::agent::AgentClient;
use crate::permission;

/// Returns the user's decision (timeout and delivery failure read as
/// rejected). Never fails the calling pipeline.
pub async fn handle_permission_event(
    config: &ChannelConfig,
    message: &NormalizedMessage,
    request: &PermissionRequest,
    adapter: &dyn Adapter,
    client: &AgentClient,
    timeout: Duration,
) -> bool {
    let registry = permission::global();
    let rx = registry.create(&request.id);

    if let Err(e) = adapter
        .send_permission_request(config, message, request)
        .await
    {
        warn!(
            permission_id = %request.id,
            "failed to deliver permission prompt; auto-rejecting: {e}"
        );
        registry.reply(&request.id, false);
        return false;
    }

    let approved = registry.wait(&request.id, rx, timeout).await;
    client.reply_permission(&request.id, approved).await;
    approved
}
