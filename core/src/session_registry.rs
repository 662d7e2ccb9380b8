// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Maps inbound messages to long-lived upstream session ids.
//!
//! The key is derived from the config's session strategy, so one config can
//! share a single session, fan out per user or per thread, or burn a fresh
//! session per message.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use courier_protocol::ChannelConfig;
use courier_protocol::NormalizedMessage;
use courier_protocol::SessionStrategy;
use tracing::debug;

use crate::agent::AgentClient;
use crate::error::Result;

pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionScope {
    Single,
    User(String),
    Thread(String),
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    config_id: String,
    scope: SessionScope,
}

impl SessionKey {
    fn derive(config_id: &str, strategy: SessionStrategy, message: &NormalizedMessage) -> Self {
        let scope = match strategy {
            SessionStrategy::Single => SessionScope::Single,
            SessionStrategy::PerUser => SessionScope::User(message.user.id.clone()),
            SessionStrategy::PerThread => SessionScope::Thread(
                message
                    .thread_id
                    .clone()
                    .unwrap_or_else(|| message.user.id.clone()),
            ),
            SessionStrategy::PerMessage => SessionScope::Message(message.external_id.clone()),
        };
        Self {
            config_id: config_id.to_string(),
            scope,
        }
    }
}

struct SessionEntry {
    session_id: String,
    created_at: Instant,
    last_used_at: Instant,
    /// Platform user that created the entry; lets the active-session lookup
    /// scan without parsing keys.
    user_id: String,
}

/// A session known to be active for a given user, as reported by
/// [`SessionRegistry::active_session_id`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub session_id: String,
    pub age: Duration,
}

pub struct SessionRegistry {
    idle_ttl: Duration,
    entries: Mutex<HashMap<SessionKey, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            idle_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for this message's key, or create one
    /// upstream. A failed create propagates and caches nothing.
    pub async fn resolve(
        &self,
        config: &ChannelConfig,
        message: &NormalizedMessage,
        client: &AgentClient,
        agent_name: Option<&str>,
    ) -> Result<String> {
        let key = SessionKey::derive(&config.id, config.session_strategy, message);

        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&key) {
                if entry.last_used_at.elapsed() < self.idle_ttl {
                    entry.last_used_at = Instant::now();
                    return Ok(entry.session_id.clone());
                }
                entries.remove(&key);
            }
        }

        let session_id = client.create_session(agent_name).await?;
        debug!(
            config_id = %config.id,
            session_id = %session_id,
            "created upstream session"
        );

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            SessionEntry {
                session_id: session_id.clone(),
                created_at: now,
                last_used_at: now,
                user_id: message.user.id.clone(),
            },
        );
        Ok(session_id)
    }

    /// Drop the entry for this message's key, forcing the next resolve to
    /// create a fresh upstream session.
    pub fn invalidate(
        &self,
        config_id: &str,
        strategy: SessionStrategy,
        message: &NormalizedMessage,
    ) {
        let key = SessionKey::derive(config_id, strategy, message);
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(&key).is_some() {
            debug!(config_id, "invalidated session entry");
        }
    }

    /// Most recently used session belonging to `user_id` under `config_id`.
    /// The registry stays small (bounded by active concurrent users), so a
    /// scan is fine.
    pub fn active_session_id(&self, config_id: &str, user_id: &str) -> Option<ActiveSession> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(key, entry)| key.config_id == config_id && entry.user_id == user_id)
            .max_by_key(|(_, entry)| entry.last_used_at)
            .map(|(_, entry)| ActiveSession {
                session_id: entry.session_id.clone(),
                age: entry.created_at.elapsed(),
            })
    }

    /// Drop entries idle for more than twice the TTL.
    pub fn cleanup(&self) {
        let threshold = self.idle_ttl * 2;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.last_used_at.elapsed() < threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::PlatformUser;

    fn message(user_id: &str, thread_id: Option<&str>, external_id: &str) -> NormalizedMessage {
        NormalizedMessage {
            external_id: external_id.to_string(),
            platform: courier_protocol::PlatformKind::Slack,
            config_id: "cfg1".to_string(),
            chat_type: courier_protocol::ChatType::Dm,
            content: "hi".to_string(),
            attachments: Vec::new(),
            user: PlatformUser {
                id: user_id.to_string(),
                name: user_id.to_string(),
                avatar: None,
            },
            thread_id: thread_id.map(str::to_string),
            group_id: None,
            mentioned: false,
            thread_context: Vec::new(),
            overrides: Default::default(),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn per_thread_key_falls_back_to_user_id() {
        let with_thread = SessionKey::derive(
            "cfg1",
            SessionStrategy::PerThread,
            &message("u1", Some("t1"), "m1"),
        );
        let without_thread =
            SessionKey::derive("cfg1", SessionStrategy::PerThread, &message("u1", None, "m2"));
        assert_eq!(with_thread.scope, SessionScope::Thread("t1".to_string()));
        assert_eq!(without_thread.scope, SessionScope::Thread("u1".to_string()));
    }

    #[test]
    fn per_message_keys_never_collide() {
        let first = SessionKey::derive(
            "cfg1",
            SessionStrategy::PerMessage,
            &message("u1", None, "m1"),
        );
        let second = SessionKey::derive(
            "cfg1",
            SessionStrategy::PerMessage,
            &message("u1", None, "m2"),
        );
        assert_ne!(first, second);
    }

    #[test]
    fn single_strategy_shares_one_key_per_config() {
        let a = SessionKey::derive("cfg1", SessionStrategy::Single, &message("u1", None, "m1"));
        let b = SessionKey::derive("cfg1", SessionStrategy::Single, &message("u2", None, "m2"));
        assert_eq!(a, b);
        let other = SessionKey::derive("cfg2", SessionStrategy::Single, &message("u1", None, "m1"));
        assert_ne!(a, other);
    }
}
