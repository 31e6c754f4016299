pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use common::prelude::Client;

use crate::database::types::LogLevel;
use crate::service::{LogLevelControl, LogSink, MountResult, Service};
use crate::ServiceConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy()
}

/// Runtime control over the process-wide log filter
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelControl for LogHandle {
    fn set_level(&self, level: LogLevel) {
        if let Err(e) = self.filter.reload(env_filter(level)) {
            tracing::warn!("failed to change log level: {}", e);
        }
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program,
/// and a handle for changing the level later.
pub fn init_logging(
    service_config: &ServiceConfig,
) -> (Vec<tracing_appender::non_blocking::WorkerGuard>, LogHandle) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    let (filter, filter_handle) = reload::Layer::new(env_filter(service_config.flags.log_level));

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .boxed();

    // File layer (if log_dir is set)
    let file_layer = service_config.log_dir.as_ref().map(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "cloudfs.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    utils::register_panic_logger();
    utils::report_build_info();

    (
        guards,
        LogHandle {
            filter: filter_handle,
        },
    )
}

/// Handle for gracefully shutting down the mount service.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
    service: Arc<Service>,
}

impl ShutdownHandle {
    /// Block until a signal or [`ShutdownHandle::shutdown`], then tear every mount down.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = &mut self.graceful_waiter => {}
            _ = self.shutdown_rx.changed() => {}
        }

        if timeout(FINAL_SHUTDOWN_TIMEOUT, self.service.deinitialize())
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds",
                FINAL_SHUTDOWN_TIMEOUT.as_secs()
            );
            std::process::exit(4);
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),

    #[error("mount service failed to initialize: {0}")]
    Initialize(MountResult),
}

/// Initialize the mount service and enable its startup mounts.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it does not stop the service.
pub async fn start_service(
    service_config: &ServiceConfig,
    client: Arc<dyn Client>,
    log_control: Option<Arc<dyn LogLevelControl>>,
) -> Result<(Arc<Service>, ShutdownHandle), ProcessError> {
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker()?;

    let mut service = Service::new(client, Arc::new(LogSink));
    if let Some(control) = log_control {
        service = service.with_log_control(control);
    }
    let service = Arc::new(service);

    let result = service.initialize(service_config).await;
    if !result.is_success() {
        return Err(ProcessError::Initialize(result));
    }

    let mounts = service.list(true).await;
    tracing::info!("Running: {} mount(s) enabled", mounts.len());
    for info in &mounts {
        tracing::info!("  {} at {} ({})", info.name(), info.path, info.handle);
    }

    let handle = ShutdownHandle {
        graceful_waiter,
        shutdown_tx,
        shutdown_rx,
        service: service.clone(),
    };

    Ok((service, handle))
}

/// Runs the mount service until a shutdown signal is received. Use for CLI binary usage.
pub async fn spawn_service(
    service_config: &ServiceConfig,
    client: Arc<dyn Client>,
) -> Result<(), ProcessError> {
    let (_guards, log_handle) = init_logging(service_config);
    let (_, handle) = start_service(service_config, client, Some(Arc::new(log_handle))).await?;
    handle.wait().await;
    Ok(())
}
