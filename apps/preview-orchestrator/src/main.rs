use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use preview_orchestrator::supervisor::InstanceEvent;
use preview_orchestrator::{handlers, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!(port = config.port, data_dir = %config.data_dir.display(), "starting preview orchestrator");
    info!(
        host = %config.public.host,
        https = config.public.https,
        "public endpoint"
    );
    if !config.auth_enabled() {
        warn!("FLY_API_KEY / FLY_API_SECRET not set; control plane runs unauthenticated");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config);

    // Warm the template in the background so the first create hits the
    // clone fast path; a failure here only means create falls back to the
    // slow path.
    {
        let template = state.projects.template().clone();
        tokio::spawn(async move {
            if let Err(err) = template.initialize().await {
                error!(error = %err, "template initialisation failed");
            }
        });
    }

    // Surface the supervisor's lifecycle stream in the service log.
    {
        let mut events = state.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(InstanceEvent::Started { project_id, port }) => {
                        info!(project = %project_id, port, "instance started");
                    }
                    Ok(InstanceEvent::Stopped { project_id }) => {
                        info!(project = %project_id, "instance stopped");
                    }
                    Ok(InstanceEvent::Exited { project_id, code }) => {
                        info!(project = %project_id, ?code, "instance exited");
                    }
                    Ok(InstanceEvent::Log { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let app = handlers::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down: closing HMR splices and stopping instances");
    state.splicer.shutdown();
    state.supervisor.destroy().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
