//! End-to-end test of the process-global lifecycle.
//!
//! The global binding is write-once per process, so the whole scenario
//! lives in a single test function: bootstrap through `run_scoped`, record
//! spans inside the scope, observe the teardown drain and the idempotence
//! of every later call.

use std::borrow::Cow;
use std::time::{Duration, Instant, SystemTime};

use trace_harness::export::{ExportTarget, InMemorySpanExporter};
use trace_harness::lifecycle::global_controller;
use trace_harness::processor::BatchConfigBuilder;
use trace_harness::resource::SERVICE_NAME;
use trace_harness::span::{Key, SpanData, SpanId, Value};
use trace_harness::{LifecycleState, PipelineBuilder, TracerHandle};

fn finished_span(tracer: &TracerHandle, name: &'static str) -> SpanData {
    let now = SystemTime::now();
    SpanData {
        span_context: tracer.new_span_context(name, None),
        parent_span_id: SpanId::INVALID,
        name: Cow::Borrowed(name),
        start_time: now,
        end_time: now,
        attributes: Vec::new(),
        resource: tracer.resource().clone(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn global_pipeline_lives_for_exactly_one_scope() {
    let exporter = InMemorySpanExporter::new();
    let controller = global_controller();

    // Bind the global pipeline with an in-memory exporter so the scenario
    // can observe what was exported.
    controller
        .bootstrap_with(
            "suite-one",
            PipelineBuilder::new()
                .with_exporter(exporter.clone())
                .with_target(ExportTarget::new("http://localhost:4317").unwrap())
                .with_batch_config(
                    BatchConfigBuilder::default()
                        .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
                        .build(),
                ),
        )
        .unwrap();
    assert_eq!(controller.state(), LifecycleState::Running);

    // A later bootstrap with a different service name changes nothing.
    trace_harness::bootstrap("suite-two").unwrap();
    let tracer = trace_harness::tracer().unwrap();
    assert_eq!(
        tracer.resource().get(&Key::new(SERVICE_NAME)),
        Some(Value::from("suite-one".to_owned()))
    );

    let output = trace_harness::run_scoped("suite-one", || async {
        let tracer = trace_harness::tracer().unwrap();
        tracer.record_span(finished_span(&tracer, "inside-scope"));
        "scoped output"
    })
    .await
    .unwrap();
    assert_eq!(output, "scoped output");

    // Leaving the scope cancelled and drained the run-loop.
    assert_eq!(controller.state(), LifecycleState::Terminated);
    let names: Vec<_> = exporter
        .finished_spans()
        .into_iter()
        .map(|span| span.name)
        .collect();
    assert_eq!(names, vec![Cow::Borrowed("inside-scope")]);

    // The binding survives teardown; spans recorded now go nowhere but
    // nothing panics, and flushing stays bounded.
    tracer.record_span(finished_span(&tracer, "after-scope"));
    let started = Instant::now();
    trace_harness::flush_and_wait(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(exporter.finished_spans().len(), 1);

    // Another scoped run still executes its operation.
    let late = trace_harness::run_scoped("suite-one", || async { 9 })
        .await
        .unwrap();
    assert_eq!(late, 9);
    assert_eq!(controller.state(), LifecycleState::Terminated);
}
