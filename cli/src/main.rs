//! The `courier` binary: one HTTP listener hosting every adapter's webhook
//! routes in front of a shared dispatch engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use courier_adapters::SlackAdapter;
use courier_adapters::TelegramAdapter;
use courier_core::ConfigStore;
use courier_core::Engine;
use courier_core::EngineConfig;
use courier_core::JsonConfigStore;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Multi-platform chat-to-agent gateway")]
struct Cli {
    /// Address the webhook listener binds to.
    #[arg(long, env = "COURIER_BIND", default_value = "0.0.0.0:8787")]
    bind: SocketAddr,

    /// Directory holding configs.json and the message log.
    #[arg(long, env = "COURIER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Agent server base URL; overrides COURIER_AGENT_URL.
    #[arg(long)]
    agent_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store: Arc<dyn ConfigStore> = Arc::new(
        JsonConfigStore::open(&cli.data_dir)
            .with_context(|| format!("opening config store in {}", cli.data_dir.display()))?,
    );

    let mut engine_config = EngineConfig::default();
    if let Some(agent_url) = cli.agent_url {
        engine_config.agent_base_url = agent_url;
    }
    info!(agent_url = %engine_config.agent_base_url, "starting courier gateway");

    let engine = Engine::new(engine_config, store);
    engine.register_adapter(Arc::new(SlackAdapter::new()));
    engine.register_adapter(Arc::new(TelegramAdapter::new()));
    engine.clone().spawn_maintenance(MAINTENANCE_PERIOD);

    let router = Router::new().route("/healthz", get(healthz));
    let router = engine
        .register_all_routes(router)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(bind = %cli.bind, "webhook listener up");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}
