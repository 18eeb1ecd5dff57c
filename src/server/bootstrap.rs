use super::AppState;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Proxy lifecycle: init → load config → build state → watch → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let state = AppState::new(args.config_path).await?;
    super::spawn_background_tasks(&state);

    let shutdown = Arc::new(Notify::new());

    tracing::info!("server: starting hubproxy, listen={}", args.listen);

    let admin_handle = tokio::spawn({
        let admin_listen = args.admin_listen.clone();
        let state = state.clone();
        async move { super::run_admin_server(&admin_listen, state).await }
    });

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { super::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    admin_handle.abort();
    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT"),
        _ = terminate => tracing::info!("server: received SIGTERM"),
    }

    shutdown.notify_waiters();
}
