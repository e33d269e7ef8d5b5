use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use yellowcert::{AppState, Args, ServerConfig, YoloV8, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Args = argh::from_env();
    let config = ServerConfig::from_args(args)?;

    // a missing weights file falls back to pretrained weights, any other
    // loading failure stops the server here
    let detector_config = config.detector_config();
    let model = tokio::task::spawn_blocking(move || YoloV8::new(detector_config))
        .await?
        .inspect_err(|e| tracing::error!("error loading model: {e}"))?;

    tracing::info!("CORS allowed origins: {}", config.allowed_origins);

    let app = router(AppState::new(Arc::new(model)), &config);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!("YellowCert Detection API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
