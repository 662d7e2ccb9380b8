//! Orchestration core of the Courier gateway.
//!
//! The [`engine::Engine`] takes normalized messages from platform adapters,
//! admits them through the rate limiter, resolves an upstream session, and
//! streams the agent's reply back through the adapter that produced the
//! message. Everything here is platform-agnostic; the adapter contract in
//! [`adapter`] is the only seam platforms plug into.

pub mod adapter;
pub mod agent;
pub mod bridge;
pub mod commands;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod flags;
pub mod message_log;
pub mod permission;
pub mod rate_limiter;
pub mod readiness_queue;
pub mod session_registry;
pub mod store;

pub use adapter::Adapter;
pub use adapter::AdapterCapabilities;
pub use adapter::ConnectionType;
pub use adapter::CredentialCheck;
pub use agent::AgentClient;
pub use engine::Engine;
pub use engine::EngineConfig;
pub use error::CourierErr;
pub use error::Result;
pub use store::ConfigRow;
pub use store::ConfigStore;
pub use store::JsonConfigStore;
