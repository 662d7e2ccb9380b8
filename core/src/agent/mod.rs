//! Transport to the agent server: plain HTTP wrappers plus the SSE prompt
//! stream.

mod client;
mod sse;

pub use client::AgentClient;
pub use client::FilePart;
pub use client::ModifiedFile;
pub use client::PromptStream;
