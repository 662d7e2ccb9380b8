//! Platform adapters: concrete implementations of the core's capability
//! contract for Slack and Telegram.
//!
//! Each adapter owns its webhook verification, its REST delivery calls, and
//! the translation between platform payloads and [`NormalizedMessage`].
//!
//! [`NormalizedMessage`]: courier_protocol::NormalizedMessage

mod slack;
mod telegram;
mod text;

pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;
pub use text::chunk_text;
