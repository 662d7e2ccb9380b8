// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Process-wide registry of pending permission prompts.
//!
//! The agent asks for permission mid-stream; the user's answer arrives on a
//! different HTTP route (a button click relayed by an adapter). The route
//! handler holds no reference to the engine that is streaming, so the
//! pending entries live in one process-wide table keyed by the agent-chosen
//! permission id.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// How long a prompt may wait for the user before it auto-rejects.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

static GLOBAL: LazyLock<PermissionRegistry> = LazyLock::new(PermissionRegistry::new);

/// The process-wide registry instance.
pub fn global() -> &'static PermissionRegistry {
    &GLOBAL
}

pub struct PermissionRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending prompt and return the receiving half. A duplicate
    /// id replaces the previous entry, whose waiter then observes a reject.
    pub fn create(&self, id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        if pending.insert(id.to_string(), tx).is_some() {
            debug!(id, "replaced pending permission entry");
        }
        rx
    }

    /// Deliver the user's answer. Returns whether a pending entry existed,
    /// distinguishing "delivered" from "expired"; a second reply for the
    /// same id is a no-op and returns false.
    pub fn reply(&self, id: &str, approved: bool) -> bool {
        let sender = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(id)
        };
        match sender {
            Some(tx) => {
                // The waiter may have gone away; the entry is gone either way.
                tx.send(approved).ok();
                true
            }
            None => false,
        }
    }

    /// Await the answer for an entry previously registered with [`create`],
    /// resolving to rejected on timeout. The entry never outlives the
    /// timeout.
    ///
    /// [`create`]: Self::create
    pub async fn wait(&self, id: &str, rx: oneshot::Receiver<bool>, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => {
                // Sender dropped without a reply (replaced entry).
                self.discard(id);
                false
            }
            Err(_) => {
                debug!(id, "permission prompt timed out; auto-rejecting");
                self.discard(id);
                false
            }
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap();
        pending.len()
    }

    fn discard(&self, id: &str) {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(id);
    }
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_resolves_pending_entry_exactly_once() {
        let registry = PermissionRegistry::new();
        let rx = registry.create("p1");
        assert!(registry.is_pending("p1"));

        assert!(registry.reply("p1", true));
        assert!(!registry.is_pending("p1"));
        // Second reply hits no entry.
        assert!(!registry.reply("p1", false));

        let approved = registry
            .wait("p1", rx, Duration::from_secs(1))
            .await;
        assert!(approved);
    }

    #[tokio::test]
    async fn timeout_rejects_and_removes_entry() {
        let registry = PermissionRegistry::new();
        let rx = registry.create("p2");
        let approved = registry
            .wait("p2", rx, Duration::from_millis(20))
            .await;
        assert!(!approved);
        assert!(!registry.is_pending("p2"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_for_unknown_id_reports_expired() {
        let registry = PermissionRegistry::new();
        assert!(!registry.reply("never-created", true));
    }
}
