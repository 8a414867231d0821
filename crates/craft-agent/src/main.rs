use anyhow::Context;
use craft_agent::{AgentConfig, InstanceOrchestrator, InstanceRef};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Returns the file writer guard; dropping it flushes and closes the log.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    let log_dir = std::env::var("CRAFT_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir}: {e}");
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "craft-agent");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AgentConfig::from_env();
    tracing::info!(
        data_root = %config.data_root.display(),
        java = %config.java_bin,
        default_version = %config.default_version,
        default_memory = %config.default_memory,
        "craft-agent starting"
    );

    let orchestrator = InstanceOrchestrator::new(config)
        .await
        .context("load instance registry")?;

    // Bring every instance's scheduler and telemetry online.
    for instance in orchestrator.list_instances().await {
        if let Err(e) = orchestrator.resolve(&InstanceRef::Id(instance.id.clone())).await {
            tracing::warn!(instance_id = %instance.id, error = %e, "failed to prepare instance");
        }
    }
    tracing::info!(
        instances = orchestrator.live_instance_ids().await.len(),
        "craft-agent ready"
    );

    shutdown_signal().await;
    tracing::info!("shutdown requested; stopping servers");
    orchestrator.shutdown().await;
    tracing::info!("craft-agent stopped");
    Ok(())
}
