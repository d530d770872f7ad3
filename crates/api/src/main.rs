use std::sync::Arc;

use anyhow::Context;
use scribe_api::{app, config::AppConfig};
use scribe_infra::CommandTranscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scribe_observability::init();

    let config = AppConfig::from_env();
    tracing::info!(
        addr = %config.http_addr,
        queue = %config.task_queue,
        job_store = %config.job_store,
        workers = config.worker_count,
        upload_dir = %config.upload_dir.display(),
        "starting scribe"
    );

    let transcriber = CommandTranscriber::from_command_line(&config.transcriber_cmd)
        .context("TRANSCRIBER_CMD is empty")?;

    let wiring = app::services::build_services(&config, Arc::new(transcriber))
        .await
        .context("failed to initialize job store")?;
    let dispatcher = wiring.dispatcher.spawn();
    let app = app::build_app(wiring.services);

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("http server stopped; draining workers");
    let stats = dispatcher.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
