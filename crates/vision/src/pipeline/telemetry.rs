//! Telemetry helpers: tracing subscribers, the Prometheus metrics recorder
//! and dispatcher-aware worker threads.

use std::{
    io,
    path::Path,
    sync::OnceLock,
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, warn};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the subscriber installed and flushes the chrome trace on drop.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the global metrics recorder once and return its handle. Returns
/// `None` when another recorder was installed first.
pub(crate) fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Some(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if let Err(err) = metrics::set_global_recorder(recorder) {
        warn!("metrics recorder already installed: {err}");
        return None;
    }

    let upkeep_handle = handle.clone();
    match spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    }) {
        Ok(upkeep) => {
            let _ = PROM_UPKEEP_THREAD.set(upkeep);
        }
        Err(err) => error!("failed to spawn prometheus upkeep thread: {err}"),
    }

    Some(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber for the calling thread. Worker threads
/// inherit it through [`spawn_thread`].
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_names(true)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
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

/// Background thread that can be waited on with a deadline.
pub(crate) struct WorkerHandle {
    name: String,
    thread: Option<thread::JoinHandle<()>>,
    exited: Receiver<()>,
}

/// Like [`spawn_thread`], returning a handle whose
/// [`WorkerHandle::join_timeout`] never blocks past its deadline.
pub(crate) fn spawn_worker<F>(name: impl Into<String>, f: F) -> io::Result<WorkerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    // Dropped when the closure returns or unwinds.
    let (exit_tx, exited) = bounded::<()>(1);
    let thread = spawn_thread(name.clone(), move || {
        let _exit_tx = exit_tx;
        f();
    })?;
    Ok(WorkerHandle {
        name,
        thread: Some(thread),
        exited,
    })
}

impl WorkerHandle {
    /// Returns `false` if the thread is still running after `timeout`.
    pub(crate) fn join_timeout(&mut self, timeout: Duration) -> bool {
        if self.thread.is_none() {
            return true;
        }
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.thread.take() {
                    if handle.join().is_err() {
                        error!("{} thread panicked", self.name);
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} thread did not stop within {timeout:?}", self.name);
                false
            }
        }
    }
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
