#![allow(clippy::unwrap_used)]

use core_test_support::MemStore;
use core_test_support::RecordingAdapter;
use core_test_support::config_row;
use core_test_support::dm_message;
use core_test_support::mount_basic_agent;
use core_test_support::simple_exchange;
use core_test_support::test_engine_config;
use courier_core::commands;
use courier_core::commands::SlashCommand;
use courier_core::engine::Engine;
use courier_core::store::ConfigStore;
use pretty_assertions::assert_eq;
use wiremock::MockServer;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_switch_persists_and_next_message_observes_it() {
    let server = MockServer::start().await;
    mount_basic_agent(&server, "sess-c1", simple_exchange("sess-c1", &["ok"])).await;

    let store = MemStore::with_row(config_row("cfg1"));
    let engine = Engine::new(test_engine_config(&server.uri()), store.clone());
    let adapter = RecordingAdapter::new();
    engine.register_adapter(adapter.clone());

    let message = dm_message("cfg1", "U1", "/model openai/gpt-5");
    let config = store
        .find_enabled_by_id("cfg1")
        .await
        .unwrap()
        .unwrap()
        .hydrate()
        .unwrap();
    let reply = commands::handle(
        &engine,
        &config,
        &message,
        commands::parse("/model openai/gpt-5"),
    )
    .await
    .unwrap();
    assert_eq!(reply, "Model set to openai/gpt-5.");

    // Read-after-write: a message processed after the switch carries the
    // new model on the wire.
    engine
        .process_message(dm_message("cfg1", "U1", "hi"))
        .await
        .unwrap();
    assert_eq!(adapter.responses()[0].model_name, "openai/gpt-5");

    let prompt_request = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().ends_with("/prompt_async"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&prompt_request.body).unwrap();
    assert_eq!(body["model"]["modelID"], "gpt-5");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_switch_takes_precedence_order_into_account() {
    let server = MockServer::start().await;
    mount_basic_agent(&server, "sess-c2", simple_exchange("sess-c2", &["ok"])).await;

    let store = MemStore::with_row(config_row("cfg1"));
    let engine = Engine::new(test_engine_config(&server.uri()), store.clone());
    let adapter = RecordingAdapter::new();
    engine.register_adapter(adapter.clone());

    let config = store
        .find_enabled_by_id("cfg1")
        .await
        .unwrap()
        .unwrap()
        .hydrate()
        .unwrap();
    commands::handle(
        &engine,
        &config,
        &dm_message("cfg1", "U1", "/agent researcher"),
        SlashCommand::Agent(Some("researcher".to_string())),
    )
    .await
    .unwrap();

    // Config-level agent applies...
    engine
        .process_message(dm_message("cfg1", "U1", "hi"))
        .await
        .unwrap();
    // ...unless the message overrides it.
    let mut message = dm_message("cfg1", "U2", "hi again");
    message.overrides.agent_name = Some("reviewer".to_string());
    engine.process_message(message).await.unwrap();

    let session_creates: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/session")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(session_creates.len(), 2);
    assert_eq!(session_creates[0]["agent"], "researcher");
    assert_eq!(session_creates[1]["agent"], "reviewer");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_and_new_session_round_trip() {
    let server = MockServer::start().await;
    mount_basic_agent(&server, "sess-c3", simple_exchange("sess-c3", &["ok"])).await;

    let store = MemStore::with_row(config_row("cfg1"));
    let engine = Engine::new(test_engine_config(&server.uri()), store.clone());
    let adapter = RecordingAdapter::new();
    engine.register_adapter(adapter.clone());

    let config = store
        .find_enabled_by_id("cfg1")
        .await
        .unwrap()
        .unwrap()
        .hydrate()
        .unwrap();
    let message = dm_message("cfg1", "U1", "status");

    // No session yet.
    let reply = commands::handle(&engine, &config, &message, SlashCommand::Status)
        .await
        .unwrap();
    assert!(reply.contains("No active session"));

    engine
        .process_message(dm_message("cfg1", "U1", "hi"))
        .await
        .unwrap();
    let reply = commands::handle(&engine, &config, &message, SlashCommand::Status)
        .await
        .unwrap();
    assert!(reply.contains("sess-c3"));

    // `new` invalidates; the next message creates a second session.
    commands::handle(&engine, &config, &message, SlashCommand::NewSession)
        .await
        .unwrap();
    engine
        .process_message(dm_message("cfg1", "U1", "again"))
        .await
        .unwrap();
    let session_creates = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/session")
        .count();
    assert_eq!(session_creates, 2);
}
