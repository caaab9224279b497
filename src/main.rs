//! Guardrail gateway server binary.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guardrail_gateway::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let state = AppState::from_env().await?;
    info!(
        env = state.settings.app_env.as_str(),
        policy_version = %state.policy.default_policy().version,
        "guardrail gateway starting"
    );

    // Keep arm-mode gauges fresh even when traffic is idle.
    let arm = state.arm.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            arm.evaluate_mode();
        }
    });

    let addr = state.settings.bind_addr.clone();
    let app = router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardrail_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
