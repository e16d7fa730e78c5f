//! Tracing and Prometheus wiring.

use std::io;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{filter::EnvFilter, fmt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Install the global tracing subscriber. `verbose` lowers the default level
/// to debug; `RUST_LOG` still wins when set.
pub(crate) fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_env_filter(env_filter)
        .try_init();
}

/// Ensure the global metrics recorder is installed and return the Prometheus
/// handle.
pub(crate) fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("metrics recorder already installed; metrics may go elsewhere");
        }

        let upkeep_handle = handle.clone();
        PROM_UPKEEP_THREAD.get_or_init(|| {
            spawn_thread("prometheus-upkeep", move || loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            })
            .expect("failed to spawn prometheus upkeep thread")
        });

        handle
    })
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_carry_names() {
        let handle = spawn_thread("telemetry-test", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("telemetry-test"));
    }

    #[test]
    fn recorder_handle_is_memoized() {
        let a = init_metrics_recorder() as *const PrometheusHandle;
        let b = init_metrics_recorder() as *const PrometheusHandle;
        assert_eq!(a, b);
        assert!(prometheus_handle().is_some());
    }
}
