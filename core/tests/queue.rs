#![allow(clippy::unwrap_used)]

use core_test_support::MemStore;
use core_test_support::RecordingAdapter;
use core_test_support::config_row;
use core_test_support::dm_message;
use core_test_support::mount_create_session;
use core_test_support::mount_empty_file_status;
use core_test_support::mount_event_stream;
use core_test_support::mount_prompt_async;
use core_test_support::simple_exchange;
use core_test_support::test_engine_config;
use courier_core::engine::Engine;
use courier_core::message_log::MessageDirection;
use pretty_assertions::assert_eq;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_queued_while_unhealthy_is_processed_exactly_once() {
    let server = MockServer::start().await;
    // The engine's own gate probe plus the first two drain polls fail,
    // then the server recovers.
    Mock::given(method("GET"))
        .and(path("/global/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/global/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_create_session(&server, "sess-q1").await;
    mount_prompt_async(&server, "sess-q1").await;
    mount_event_stream(&server, simple_exchange("sess-q1", &["recovered"])).await;
    mount_empty_file_status(&server).await;

    let store = MemStore::with_row(config_row("cfg1"));
    let engine = Engine::new(test_engine_config(&server.uri()), store.clone());
    let adapter = RecordingAdapter::new();
    engine.register_adapter(adapter.clone());

    engine
        .process_message(dm_message("cfg1", "U1", "hi"))
        .await
        .unwrap();

    // Full pipeline ran once, after recovery: no double send.
    let responses = adapter.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].content, "recovered");
    assert_eq!(engine.queue().total_queue_size(), 0);

    let outbound = store
        .log_entries()
        .iter()
        .filter(|e| e.direction == MessageDirection::Outbound)
        .count();
    assert_eq!(outbound, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_deadline_rejects_without_a_platform_reply() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/global/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = MemStore::with_row(config_row("cfg1"));
    let mut config = test_engine_config(&server.uri());
    config.queue_timing.ready_deadline = std::time::Duration::from_millis(100);
    let engine = Engine::new(config, store.clone());
    let adapter = RecordingAdapter::new();
    engine.register_adapter(adapter.clone());

    let result = engine.process_message(dm_message("cfg1", "U1", "hi")).await;
    assert!(matches!(
        result,
        Err(courier_core::CourierErr::UpstreamNotReady)
    ));

    // No response was delivered; the failure surfaced as a reaction only.
    assert!(adapter.responses().is_empty());
    let outbound = store
        .log_entries()
        .iter()
        .filter(|e| e.direction == MessageDirection::Outbound)
        .count();
    assert_eq!(outbound, 0);
}
