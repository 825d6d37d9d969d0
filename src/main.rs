use careeryzer::{app, build_state, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let state = build_state(&config)?;

    if let Some(max_idle) = config.session_idle {
        let sessions = state.chat.sessions().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle);
            loop {
                ticker.tick().await;
                let removed = sessions.prune_idle(max_idle);
                if removed > 0 {
                    tracing::debug!(removed, remaining = sessions.len(), "pruned idle sessions");
                }
            }
        });
    }

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        model = %config.model,
        mode = config.completion_mode.as_str(),
        prompt = config.prompt_policy.mode_name(),
        "listening on {}",
        addr
    );
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
