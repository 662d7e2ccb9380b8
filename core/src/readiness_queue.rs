// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Buffers messages that arrive while the agent server is unhealthy.
//!
//! Messages are grouped under a queue key (currently a single constant; the
//! table stays keyed because the design admits multiple upstreams). Each key
//! has at most one drain task, which polls the health endpoint and then
//! processes the queued items strictly in FIFO order, one at a time.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use courier_protocol::ChannelConfig;
use courier_protocol::NormalizedMessage;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::agent::AgentClient;
use crate::error::CourierErr;
use crate::error::Result;

/// Queue key for the single-upstream topology.
pub const DEFAULT_QUEUE_KEY: &str = "primary";

#[derive(Debug, Clone, Copy)]
pub struct QueueTiming {
    pub poll_interval: Duration,
    pub ready_deadline: Duration,
}

impl Default for QueueTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            ready_deadline: Duration::from_secs(90),
        }
    }
}

/// Callback the drain loop feeds ready messages into. The engine implements
/// this with the post-readiness part of its pipeline.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    async fn process(&self, message: NormalizedMessage, config: ChannelConfig) -> Result<()>;
}

struct Waiting {
    message: NormalizedMessage,
    config: ChannelConfig,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Waiting>,
}

pub struct ReadinessQueue {
    timing: QueueTiming,
    processor: Weak<dyn QueueProcessor>,
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl ReadinessQueue {
    pub fn new(timing: QueueTiming, processor: Weak<dyn QueueProcessor>) -> Self {
        Self {
            timing,
            processor,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Buffer a message under `key`. The returned receiver resolves with the
    /// message's own processing result once the drain loop reaches it, or
    /// with [`CourierErr::UpstreamNotReady`] if the server never recovers.
    pub fn enqueue(
        &self,
        key: &str,
        message: NormalizedMessage,
        config: ChannelConfig,
        client: AgentClient,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let start_drain = {
            let mut queues = self.queues.lock().unwrap();
            let fresh = !queues.contains_key(key);
            queues.entry(key.to_string()).or_default().items.push_back(Waiting {
                message,
                config,
                done: tx,
            });
            fresh
        };

        if start_drain {
            debug!(key, "starting readiness drain loop");
            tokio::spawn(drain_loop(
                self.queues.clone(),
                key.to_string(),
                client,
                self.processor.clone(),
                self.timing,
            ));
        }
        rx
    }

    pub fn queue_size(&self, key: &str) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(key).map_or(0, |state| state.items.len())
    }

    pub fn total_queue_size(&self) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.values().map(|state| state.items.len()).sum()
    }
}

async fn drain_loop(
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    key: String,
    client: AgentClient,
    processor: Weak<dyn QueueProcessor>,
    timing: QueueTiming,
) {
    let deadline = Instant::now() + timing.ready_deadline;
    let mut ready = false;
    loop {
        if client.is_ready().await {
            ready = true;
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(timing.poll_interval).await;
    }

    if !ready {
        warn!(%key, "agent server did not become ready; rejecting queued messages");
        reject_all(&queues, &key, || CourierErr::UpstreamNotReady);
        return;
    }

    loop {
        // Pop-or-delete must be atomic so a message enqueued after the last
        // pop still finds a live drain loop or starts a fresh one.
        let next = {
            let mut queues = queues.lock().unwrap();
            match queues.get_mut(&key) {
                Some(state) => match state.items.pop_front() {
                    Some(item) => Some(item),
                    None => {
                        queues.remove(&key);
                        None
                    }
                },
                None => None,
            }
        };
        let Some(item) = next else {
            debug!(%key, "readiness drain complete");
            return;
        };

        let Some(processor) = processor.upgrade() else {
            let _ = item.done.send(Err(CourierErr::Stream(
                "engine shut down while messages were queued".to_string(),
            )));
            reject_all(&queues, &key, || {
                CourierErr::Stream("engine shut down while messages were queued".to_string())
            });
            return;
        };

        let result = processor.process(item.message, item.config).await;
        let _ = item.done.send(result);
    }
}

fn reject_all(
    queues: &Mutex<HashMap<String, QueueState>>,
    key: &str,
    error: impl Fn() -> CourierErr,
) {
    let items = {
        let mut queues = queues.lock().unwrap();
        queues
            .remove(key)
            .map(|state| state.items)
            .unwrap_or_default()
    };
    for item in items {
        let _ = item.done.send(Err(error()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::ChatType;
    use courier_protocol::PlatformKind;
    use courier_protocol::PlatformUser;
    use courier_protocol::SessionStrategy;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_message(n: usize) -> NormalizedMessage {
        NormalizedMessage {
            external_id: format!("m{n}"),
            platform: PlatformKind::Slack,
            config_id: "cfg1".to_string(),
            chat_type: ChatType::Dm,
            content: format!("msg {n}"),
            attachments: Vec::new(),
            user: PlatformUser {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                avatar: None,
            },
            thread_id: None,
            group_id: None,
            mentioned: false,
            thread_context: Vec::new(),
            overrides: Default::default(),
            raw: serde_json::Value::Null,
        }
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            id: "cfg1".to_string(),
            platform: PlatformKind::Slack,
            name: "test".to_string(),
            enabled: true,
            credentials: Default::default(),
            platform_config: Default::default(),
            metadata: Default::default(),
            session_strategy: SessionStrategy::PerUser,
            system_prompt: None,
            agent_name: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Records processed message ids and asserts no two process calls
    /// overlap in time.
    struct RecordingProcessor {
        order: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
    }

    #[async_trait]
    impl QueueProcessor for RecordingProcessor {
        async fn process(&self, message: NormalizedMessage, _config: ChannelConfig) -> Result<()> {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "drain must be strictly sequential");
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.order.lock().unwrap().push(message.external_id);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejects_everything_when_server_never_recovers() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/global/health"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let processor: Arc<dyn QueueProcessor> = Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        });
        let queue = ReadinessQueue::new(
            QueueTiming {
                poll_interval: Duration::from_millis(10),
                ready_deadline: Duration::from_millis(50),
            },
            Arc::downgrade(&processor),
        );

        let client = AgentClient::new(server.uri());
        let rx1 = queue.enqueue(DEFAULT_QUEUE_KEY, test_message(1), test_config(), client.clone());
        let rx2 = queue.enqueue(DEFAULT_QUEUE_KEY, test_message(2), test_config(), client);
        assert_eq!(queue.queue_size(DEFAULT_QUEUE_KEY), 2);

        assert!(matches!(
            rx1.await.unwrap(),
            Err(CourierErr::UpstreamNotReady)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(CourierErr::UpstreamNotReady)
        ));
        assert_eq!(queue.total_queue_size(), 0);
    }

    #[tokio::test]
    async fn drains_fifo_once_server_recovers() {
        let server = wiremock::MockServer::start().await;
        // First two polls fail, then the server is healthy.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/global/health"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/global/health"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let recorder = Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        });
        let processor: Arc<dyn QueueProcessor> = recorder.clone();
        let queue = ReadinessQueue::new(
            QueueTiming {
                poll_interval: Duration::from_millis(10),
                ready_deadline: Duration::from_secs(5),
            },
            Arc::downgrade(&processor),
        );

        let client = AgentClient::new(server.uri());
        let mut receivers = Vec::new();
        for n in 1..=4 {
            receivers.push(queue.enqueue(
                DEFAULT_QUEUE_KEY,
                test_message(n),
                test_config(),
                client.clone(),
            ));
        }

        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(
            recorder.order.lock().unwrap().as_slice(),
            ["m1", "m2", "m3", "m4"]
        );
        assert_eq!(queue.total_queue_size(), 0);
    }
}
