use std::fs::OpenOptions;
use std::path::Path;

use ntables::Error;
use ntables::NtConfig;
use ntables::NtInstance;
use ntables::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = NtConfig::new()?.validate()?;
    let instance = NtInstance::new(settings.clone());

    // Initializing Logs
    let _guard = init_observability(&settings, &instance)?;
    ntables::register_custom_metrics(&ntables::REGISTRY);

    info!(mode = ?settings.network.mode, identity = %settings.identity, "starting");
    if let Err(e) = instance.start().await {
        error!("start failed: {}", e);
        return Err(e);
    }

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = graceful_shutdown().await {
        error!("Failed to wait for shutdown signal: {:?}", e);
    }

    instance.stop().await;
    if let (ntables::NetworkMode::Server, Some(path)) = (settings.network.mode, &settings.persistence.file) {
        if let Err(e) = instance.save_persistent(path) {
            error!(path = %path.display(), "final persistent save failed: {}", e);
        }
    }

    info!("Shutdown completed");
    Ok(())
}

async fn graceful_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(e.to_string()))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::Fatal(e.to_string()))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}

/// stderr always; a non-blocking file writer too when `log_dir` is set.
/// Every event is also forwarded to the instance's log listeners.
fn init_observability(
    settings: &NtConfig,
    instance: &NtInstance,
) -> Result<Option<WorkerGuard>> {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());

    let (file, guard) = match &settings.log_dir {
        Some(dir) => {
            let log_file = open_file_for_append(&dir.join("nt-server.log"))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(EnvFilter::from_default_env());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .with(instance.log_layer())
        .init();

    Ok(guard)
}

fn open_file_for_append(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Fatal(format!("{}: {}", parent.display(), e)))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Fatal(format!("{}: {}", path.display(), e)))
}
