use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rabbit_relay::{
    api, relay, BrokerLink, Epoch, Registry, RelayConfig, RelayContext, SpecStore as _,
    SqliteStore, Supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env().context("invalid configuration")?;

    let store = SqliteStore::open(&config.db_path)
        .await
        .context("failed to open the config store")?;
    tracing::info!(path = %config.db_path.display(), "config store ready");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(RelayContext {
        config: config.clone(),
        store: Arc::new(store),
        registry: Registry::new(),
        epoch: Epoch::new(),
        link: RwLock::new(None),
        events: events_tx,
        http: reqwest::Client::new(),
        // Process exit is the recovery primitive of last resort; the
        // container supervisor restarts us with a consistent snapshot.
        on_fatal: Arc::new(|_message| {
            std::process::exit(1);
        }),
    });

    let link = BrokerLink::connect(&config.rabbitmq_url, ctx.events.clone(), &ctx.epoch)
        .await
        .context("failed to connect to RabbitMQ")?;
    *ctx.link.write().await = Some(link.clone());

    let restored = relay::restore_from_store(&ctx, &link)
        .await
        .context("failed to restore persisted consumers")?;
    tracing::info!(consumers = restored, "restored persisted consumers");

    tokio::spawn(Supervisor::new(ctx.clone(), events_rx).run());

    let listener = TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.api_port))?;
    tracing::info!(port = config.api_port, "control API listening");

    axum::serve(listener, api::router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server failed")?;

    tracing::info!("shutting down");
    if let Some(link) = ctx.link.write().await.take() {
        link.close().await;
    }
    ctx.store
        .close()
        .await
        .context("failed to checkpoint the config store")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
