use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global fmt subscriber. The returned guard must be held for
/// the life of the process or buffered log lines are lost on exit.
pub fn init_tracing(
    service_name: &str,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}={level},{level}")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    Some(guard)
}

/// Installs the process-wide prometheus recorder. Counter creation after
/// this point never fails; a second call returns the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = PROM_HANDLE.get() {
        return handle.clone();
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder");

    let _ = PROM_HANDLE.set(handle.clone());
    handle
}

/// Renders the accumulated counters to stdout on a fixed interval.
/// Counters are monotonic, so consumers diff successive dumps themselves.
pub fn spawn_metrics_printer(handle: PrometheusHandle, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            let rendered = handle.render();
            if !rendered.is_empty() {
                println!("{rendered}");
            }
        }
    });
}
