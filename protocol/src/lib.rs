//! Shared data model for the Courier gateway.
//!
//! Everything that crosses a crate boundary lives here: the normalized
//! message form adapters hand to the engine, the channel configuration the
//! store hydrates, and the typed events the agent stream reader emits.

mod agent;
mod config;
mod message;

pub use agent::AgentResponse;
pub use agent::FileOutput;
pub use agent::PermissionRequest;
pub use agent::StreamEvent;
pub use config::ChannelConfig;
pub use config::ModelRef;
pub use config::SessionStrategy;
pub use message::Attachment;
pub use message::AttachmentKind;
pub use message::ChatType;
pub use message::MessageOverrides;
pub use message::NormalizedMessage;
pub use message::PlatformKind;
pub use message::PlatformUser;
pub use message::ThreadContextEntry;
