//! Pipeline lifecycle management.
//!
//! A [`LifecycleController`] owns the state machine around one assembled
//! pipeline: bootstrap it exactly once, keep the run-loop alive while
//! callers need it, and tear it down with a best-effort drain. The crate's
//! free functions [`bootstrap`], [`run_scoped`] and [`flush_and_wait`]
//! operate on a process-global controller so a whole test binary shares a
//! single pipeline.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ConfigError;
use crate::pipeline::{PipelineBuilder, TracerHandle};
use crate::resource::Resource;

/// Upper bound on waiting for the run-loop to drain during teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable states of the pipeline lifecycle.
///
/// Transitions are monotonic. The only teardown path is `Running ->
/// Draining -> Terminated`; the one exception is a failed bootstrap, which
/// falls back from `Bootstrapping` to `Uninitialized` because nothing was
/// ever started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LifecycleState {
    /// No pipeline exists yet.
    #[default]
    Uninitialized,
    /// A pipeline is being assembled and bound.
    Bootstrapping,
    /// The run-loop is live and spans are flowing.
    Running,
    /// Cancellation was requested; one final drain is in progress.
    Draining,
    /// The run-loop has exited. The binding itself stays in place.
    Terminated,
}

/// Cancellation handle for a spawned run-loop.
///
/// Exists exactly while the lifecycle is `Running` or `Draining`.
#[derive(Debug)]
pub(crate) struct RunHandle {
    cancel: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    pub(crate) fn new(cancel: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        RunHandle {
            cancel,
            join: Mutex::new(Some(join)),
        }
    }

    /// Signal the run-loop to stop. Safe to call any number of times,
    /// including after the loop has already exited.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the run-loop to finish, up to [`DRAIN_TIMEOUT`].
    pub(crate) async fn join(&self) {
        let join = self.join.lock().ok().and_then(|mut slot| slot.take());
        if let Some(join) = join {
            match tokio::time::timeout(DRAIN_TIMEOUT, join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "span pipeline run-loop panicked"),
                Err(_) => warn!(
                    timeout = ?DRAIN_TIMEOUT,
                    "span pipeline did not drain in time; abandoning it"
                ),
            }
        }
    }
}

#[derive(Debug, Default)]
struct ControllerInner {
    state: LifecycleState,
    run: Option<Arc<RunHandle>>,
}

/// Bootstraps the pipeline at most once and supervises its run-loop.
///
/// Controllers are cheap to construct for tests; production code goes
/// through the process-global instance via the free functions.
#[derive(Debug, Default)]
pub struct LifecycleController {
    inner: Mutex<ControllerInner>,
    // Write-once registry cell. Once a handle is bound here it stays bound
    // for the life of the process (or controller), even after teardown.
    handle: OnceLock<Arc<TracerHandle>>,
}

impl LifecycleController {
    /// Create a controller with nothing bootstrapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(LifecycleState::Terminated)
    }

    /// The bound pipeline, if one was ever bootstrapped.
    pub fn tracer(&self) -> Option<Arc<TracerHandle>> {
        self.handle.get().cloned()
    }

    /// Bootstrap the pipeline for `service_name` with default collaborators.
    ///
    /// Idempotent: every call after the first (regardless of service name)
    /// observes the existing binding and returns `Ok` without rebuilding.
    /// Must be called within a Tokio runtime.
    pub fn bootstrap(&self, service_name: &str) -> Result<(), ConfigError> {
        self.bootstrap_with(service_name, PipelineBuilder::new())
    }

    /// Bootstrap with an explicit [`PipelineBuilder`], for injecting
    /// exporters and samplers in tests.
    pub fn bootstrap_with(
        &self,
        service_name: &str,
        builder: PipelineBuilder,
    ) -> Result<(), ConfigError> {
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.handle.get().is_some() || inner.state != LifecycleState::Uninitialized {
                debug!(service_name, "pipeline already bootstrapped; keeping it");
                return Ok(());
            }
            inner.state = LifecycleState::Bootstrapping;
        }

        let resource = Resource::build(service_name, []);
        let handle = match builder.assemble(resource) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                // Nothing was started, so a retry is still possible.
                self.set_state(LifecycleState::Uninitialized);
                return Err(err);
            }
        };

        if self.handle.set(Arc::clone(&handle)).is_err() {
            // Lost a race against another bootstrap; its binding wins.
            debug!(service_name, "pipeline bound concurrently; keeping it");
            return Ok(());
        }

        match handle.take_worker() {
            Some((worker, cancel)) => {
                let join = tokio::spawn(worker.run());
                let mut inner = match self.inner.lock() {
                    Ok(inner) => inner,
                    Err(poisoned) => poisoned.into_inner(),
                };
                inner.run = Some(Arc::new(RunHandle::new(cancel, join)));
                inner.state = LifecycleState::Running;
                debug!(service_name, "span pipeline running");
            }
            // A freshly assembled pipeline always carries its worker; treat
            // a missing one as an already-finished lifecycle.
            None => {
                error!(service_name, "assembled pipeline had no worker to spawn");
                self.set_state(LifecycleState::Terminated);
            }
        }
        Ok(())
    }

    /// Bootstrap if needed, run `operation` while the pipeline is live, then
    /// cancel and drain the run-loop.
    ///
    /// The operation's output is returned verbatim inside `Ok`; an `Err` it
    /// produces is its own result, not a lifecycle failure.
    pub async fn run_scoped<F, Fut>(
        &self,
        service_name: &str,
        operation: F,
    ) -> Result<Fut::Output, ConfigError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.bootstrap(service_name)?;
        let output = operation().await;
        self.teardown().await;
        Ok(output)
    }

    /// Ask the pipeline to export everything buffered so far, waiting at
    /// most `max_wait`.
    ///
    /// Failures and timeouts are logged, never returned; this always comes
    /// back within `max_wait` plus scheduling slack. A no-op when nothing
    /// was bootstrapped.
    pub async fn flush_and_wait(&self, max_wait: Duration) {
        let Some(handle) = self.handle.get() else {
            debug!("no pipeline bootstrapped; nothing to flush");
            return;
        };
        match tokio::time::timeout(max_wait, handle.force_flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "flushing the span pipeline failed"),
            Err(_) => warn!(?max_wait, "flushing the span pipeline timed out"),
        }
    }

    /// Cancel the run-loop and wait for it to drain. No-op unless the
    /// lifecycle is `Running`.
    async fn teardown(&self) {
        let run = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.state != LifecycleState::Running {
                return;
            }
            inner.state = LifecycleState::Draining;
            inner.run.as_ref().map(Arc::clone)
        };

        if let Some(run) = run {
            run.cancel();
            run.join().await;
        }

        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.run = None;
        inner.state = LifecycleState::Terminated;
        debug!("span pipeline terminated");
    }

    fn set_state(&self, state: LifecycleState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = state;
        }
    }
}

static GLOBAL_CONTROLLER: OnceLock<LifecycleController> = OnceLock::new();

/// The process-global lifecycle controller backing the free functions.
pub fn global_controller() -> &'static LifecycleController {
    GLOBAL_CONTROLLER.get_or_init(LifecycleController::new)
}

/// Bootstrap the process-global pipeline for `service_name`.
///
/// Safe to call from every test; only the first call builds anything.
pub fn bootstrap(service_name: &str) -> Result<(), ConfigError> {
    global_controller().bootstrap(service_name)
}

/// Run `operation` against the process-global pipeline, tearing the
/// run-loop down afterwards.
pub async fn run_scoped<F, Fut>(service_name: &str, operation: F) -> Result<Fut::Output, ConfigError>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    global_controller().run_scoped(service_name, operation).await
}

/// Flush the process-global pipeline, waiting at most `max_wait`. Never
/// fails; meant for the tail end of a test run.
pub async fn flush_and_wait(max_wait: Duration) {
    global_controller().flush_and_wait(max_wait).await
}

/// The process-global pipeline handle, if one was bootstrapped.
pub fn tracer() -> Option<Arc<TracerHandle>> {
    global_controller().tracer()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportResult;
    use crate::export::{ExportTarget, InMemorySpanExporter, SpanExporter, ENV_EXPORT_ENDPOINT};
    use crate::processor::BatchConfigBuilder;
    use crate::resource::SERVICE_NAME;
    use crate::span::{test_span, Key, SpanData, Value};
    use futures_util::future::BoxFuture;
    use std::fmt;
    use std::time::Instant;

    fn test_builder(exporter: InMemorySpanExporter) -> PipelineBuilder {
        PipelineBuilder::new()
            .with_exporter(exporter)
            .with_target(ExportTarget::new("http://localhost:4317").unwrap())
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
                    .build(),
            )
    }

    fn service_name(controller: &LifecycleController) -> Option<Value> {
        controller
            .tracer()
            .and_then(|tracer| tracer.resource().get(&Key::new(SERVICE_NAME)))
    }

    struct StuckExporter;

    impl fmt::Debug for StuckExporter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("exporter that never completes")
        }
    }

    impl SpanExporter for StuckExporter {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60 * 60)).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_and_first_service_wins() {
        let controller = LifecycleController::new();
        let first = InMemorySpanExporter::new();
        let second = InMemorySpanExporter::new();

        controller
            .bootstrap_with("svc-one", test_builder(first.clone()))
            .unwrap();
        controller
            .bootstrap_with("svc-two", test_builder(second.clone()))
            .unwrap();

        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(
            service_name(&controller),
            Some(Value::from("svc-one".to_owned()))
        );

        // the second builder was never assembled into a running pipeline
        let tracer = controller.tracer().unwrap();
        tracer.record_span(test_span("probe"));
        tracer.force_flush().await.unwrap();
        assert_eq!(first.finished_spans().len(), 1);
        assert!(second.finished_spans().is_empty());
    }

    #[tokio::test]
    async fn failed_bootstrap_reverts_and_allows_retry() {
        let controller = LifecycleController::new();

        temp_env::with_var(ENV_EXPORT_ENDPOINT, Some("::not:an:endpoint::"), || {
            let result = controller.bootstrap("svc");
            assert!(matches!(result, Err(ConfigError::InvalidEndpoint { .. })));
        });
        assert_eq!(controller.state(), LifecycleState::Uninitialized);
        assert!(controller.tracer().is_none());

        controller
            .bootstrap_with("svc", test_builder(InMemorySpanExporter::new()))
            .unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn run_scoped_tears_the_pipeline_down() {
        let controller = LifecycleController::new();
        let exporter = InMemorySpanExporter::new();

        controller
            .bootstrap_with("svc", test_builder(exporter.clone()))
            .unwrap();
        let output = controller
            .run_scoped("svc", || async {
                let tracer = controller.tracer().unwrap();
                tracer.record_span(test_span("inside"));
                "done"
            })
            .await
            .unwrap();

        assert_eq!(output, "done");
        assert_eq!(controller.state(), LifecycleState::Terminated);
        // the drain on cancellation exported the buffered span
        assert_eq!(exporter.finished_spans().len(), 1);
        // the binding survives teardown
        assert!(controller.tracer().is_some());
    }

    #[tokio::test]
    async fn run_scoped_after_teardown_still_runs_the_operation() {
        let controller = LifecycleController::new();
        controller
            .bootstrap_with("svc", test_builder(InMemorySpanExporter::new()))
            .unwrap();
        controller.run_scoped("svc", || async {}).await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Terminated);

        let output = controller.run_scoped("svc", || async { 7 }).await.unwrap();
        assert_eq!(output, 7);
        assert_eq!(controller.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn operation_errors_pass_through_unwrapped() {
        let controller = LifecycleController::new();
        controller
            .bootstrap_with("svc", test_builder(InMemorySpanExporter::new()))
            .unwrap();
        let result = controller
            .run_scoped("svc", || async { Err::<(), &str>("boom") })
            .await
            .unwrap();
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test]
    async fn flush_and_wait_returns_within_the_bound() {
        let controller = LifecycleController::new();
        controller
            .bootstrap_with(
                "svc",
                PipelineBuilder::new()
                    .with_exporter(StuckExporter)
                    .with_target(ExportTarget::new("http://localhost:4317").unwrap())
                    .with_batch_config(
                        BatchConfigBuilder::default()
                            .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
                            .build(),
                    ),
            )
            .unwrap();

        let tracer = controller.tracer().unwrap();
        tracer.record_span(test_span("stuck"));

        let started = Instant::now();
        controller.flush_and_wait(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn flush_and_wait_without_bootstrap_is_a_noop() {
        let controller = LifecycleController::new();
        controller.flush_and_wait(Duration::from_millis(10)).await;
        assert_eq!(controller.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn cancelling_a_run_handle_twice_is_safe() {
        let (cancel, mut cancelled) = watch::channel(false);
        let join = tokio::spawn(async move {
            let _ = cancelled.changed().await;
        });
        let run = RunHandle::new(cancel, join);

        run.cancel();
        run.join().await;
        // the loop is gone; cancelling again must not panic
        run.cancel();
        run.join().await;
    }
}
