use anyhow::Result;
use relayhub_server::state::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayhub_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting relay hub...");

    // Load configuration
    let config = Config::load()?;

    let runtime = relayhub_server::create_media_runtime(&config);
    let bind_address = config.bind_address.clone();

    // Build the router
    let (app, _hub) = relayhub_server::create_app(config, runtime);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
