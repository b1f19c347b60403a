//! SchemaForge server: wires the library to PostgreSQL when `DATABASE_URL` is set,
//! otherwise to in-memory storage.
//!
//! Run from repo root: `cargo run -p schemaforge-server`

use schemaforge::{app, AppState, Settings};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("schemaforge=info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let bind_addr = settings.bind_addr.clone();
    let state = AppState::from_settings(settings).await?;

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("schemaforge listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
