use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,local_llm_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = local_llm_bridge::build_state()?;
    let addr = state.config.bind_addr;
    let shutdown = state.shutdown.clone();
    let app = local_llm_bridge::build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, cancelling open sessions");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
