//! The capability surface every platform implementation must satisfy.
//!
//! Required capabilities are plain trait methods. Optional capabilities are
//! default-implemented and paired with probe methods or capability flags;
//! the engine never invokes one without probing first.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use courier_protocol::AgentResponse;
use courier_protocol::ChannelConfig;
use courier_protocol::FileOutput;
use courier_protocol::NormalizedMessage;
use courier_protocol::PermissionRequest;
use courier_protocol::PlatformKind;
use serde_json::Map;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::CourierErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Webhook,
    Gateway,
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    /// Longest text message the platform accepts in one delivery.
    pub text_chunk_limit: usize,
    pub supports_rich_text: bool,
    pub supports_editing: bool,
    pub supports_typing_indicator: bool,
    pub supports_attachments: bool,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CredentialCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl CredentialCheck {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Attach this platform's webhook routes to the host router. The engine
    /// is passed here, not stored, so adapters never hold the engine and the
    /// reference cycle stays broken.
    fn register_routes(&self, router: Router, engine: Arc<Engine>) -> Router;

    /// Deliver the final response text, respecting the chunk limit.
    async fn send_response(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        response: &AgentResponse,
    ) -> Result<()>;

    /// Check credentials against the platform. May mutate the bag to record
    /// derived fields (bot user id, team id).
    async fn validate_credentials(&self, credentials: &mut Map<String, Value>) -> CredentialCheck;

    // ------------------------------------------------------------------
    // Optional capabilities. Probe before calling.
    // ------------------------------------------------------------------

    async fn send_typing_indicator(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_typing_indicator(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        Ok(())
    }

    fn supports_reactions(&self) -> bool {
        false
    }

    async fn react_complete(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn react_error(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn react_files_changed(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_files(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
        _files: &[FileOutput],
    ) -> Result<()> {
        Ok(())
    }

    fn supports_permission_requests(&self) -> bool {
        false
    }

    /// Prompt the user for a yes/no permission decision. Required by the
    /// permission bridge; the engine skips the prompt path entirely when
    /// [`supports_permission_requests`] is false.
    ///
    /// [`supports_permission_requests`]: Self::supports_permission_requests
    async fn send_permission_request(
        &self,
        _config: &ChannelConfig,
        _message: &NormalizedMessage,
        _permission: &PermissionRequest,
    ) -> Result<()> {
        Err(CourierErr::Adapter(
            "permission prompts not supported".to_string(),
        ))
    }

    async fn on_channel_created(&self, _config: &ChannelConfig) -> Result<()> {
        Ok(())
    }

    async fn on_channel_removed(&self, _config: &ChannelConfig) -> Result<()> {
        Ok(())
    }
}
