use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use smsbridge::{config::AppConfig, db, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "gateway",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        mode = ?config.gateway_mode,
        push = ?config.push_mode,
        "loaded configuration"
    );

    let pool = db::init_pool(&config.database_url, config.database_max_pool_size)?;
    let listen = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config)?;

    // Long-lived background loops; they end when the process does.
    {
        let events = state.events.clone();
        tokio::spawn(async move { events.run().await });
    }
    {
        let push = state.push.clone();
        tokio::spawn(async move { push.run().await });
    }
    {
        let online = state.online.clone();
        tokio::spawn(async move { online.run().await });
    }
    tokio::spawn(state.hashing.clone().run());

    let router = routes::create_router(state.clone());
    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.pubsub.close();
    state.sse.close();
    tracing::info!("gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
