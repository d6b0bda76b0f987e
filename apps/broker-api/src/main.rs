use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broker_api::bus::{BusAdapter, PUBLISH_CHANNEL_CAPACITY};
use broker_api::config::Config;
use broker_api::{broker, routes, AppState};

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());

    let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
    let broker = broker::spawn(config.clone(), publish_tx.clone());

    let bus = BusAdapter::new(config.clone(), broker.clone()).expect("invalid REDIS_URL");
    bus.start(publish_rx);

    tracing::info!(
        redis = %config.redis_url,
        ws_path = %config.ws_path,
        "broker-api configured"
    );

    let state = AppState {
        config: config.clone(),
        broker,
        publish: publish_tx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(&config)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.bind_addr;
    tracing::info!(%addr, "broker-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
}
