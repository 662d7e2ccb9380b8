//! Append-only audit log of inbound and outbound messages.
//!
//! One JSON object per line in `messages.jsonl` so the file can be appended
//! efficiently and parsed with standard JSON-Lines tooling. To minimise the
//! chance of interleaved writes when multiple processes append concurrently,
//! the full line (record + trailing `\n`) is written with a single
//! `write(2)` call on a descriptor opened with `O_APPEND`, under an advisory
//! lock. The core never reads this file back.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Result;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const MAX_RETRIES: usize = 10;
const RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub direction: MessageDirection,
    pub config_id: String,
    pub external_id: String,
    pub content: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub ts: u64,
}

/// Append one entry to the log file at `path`, creating parents as needed.
pub async fn append_entry(path: &Path, entry: &MessageLogEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Construct the JSON line first so it goes out in a single syscall.
    let mut line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::other(format!("failed to serialise log entry: {e}")))?;
    line.push('\n');

    let mut options = OpenOptions::new();
    options.append(true).read(true).create(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let path = path.to_path_buf();

    // Sync I/O under spawn_blocking: the advisory locking API is only
    // available on std::fs::File.
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut file = options.open(&path)?;
        ensure_owner_only_permissions(&file)?;
        acquire_exclusive_lock_with_retry(&file)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(format!("log writer task failed: {e}")))??;

    Ok(())
}

/// Attempt to acquire an exclusive advisory lock, retrying a bounded number
/// of times so a stuck peer cannot wedge the pipeline.
fn acquire_exclusive_lock_with_retry(file: &File) -> Result<()> {
    for _ in 0..MAX_RETRIES {
        match fs2::FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::WouldBlock,
        "could not acquire exclusive lock on message log after multiple attempts",
    ))
}

#[cfg(unix)]
fn ensure_owner_only_permissions(file: &File) -> Result<()> {
    let metadata = file.metadata()?;
    let current_mode = metadata.permissions().mode() & 0o777;
    if current_mode != 0o600 {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_only_permissions(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn entry(direction: MessageDirection, content: &str) -> MessageLogEntry {
        MessageLogEntry {
            direction,
            config_id: "cfg1".to_string(),
            external_id: "m1".to_string(),
            content: content.to_string(),
            user_id: "u1".to_string(),
            user_name: "Alice".to_string(),
            session_id: None,
            ts: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn appends_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");

        append_entry(&path, &entry(MessageDirection::Inbound, "hi")).await.unwrap();
        append_entry(&path, &entry(MessageDirection::Outbound, "hello")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: MessageLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.direction, MessageDirection::Inbound);
        assert_eq!(first.content, "hi");
    }
}
