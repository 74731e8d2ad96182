//! End-to-end tests of the pipeline lifecycle: staging, promotion, the
//! deadline-bound stop protocol, quarantine reconciliation, and teardown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sluice::config::AgentConfig;
use sluice::control::AsyncControl;
use sluice::error::ManagerError;
use sluice::manager::PipelineManager;
use sluice::pipeline::{Pipeline, PipelineBuilder};
use sluice::plugin::PluginKind;
use sluice::runner::RunnerParams;

use common::{CountingInput, Gate, MemoryFlusher, PanickyStopService, SlowStopService};

fn manager_with_timeout(stop_timeout: Duration) -> PipelineManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = AgentConfig {
        stop_timeout,
        ..Default::default()
    };
    PipelineManager::new(config, tokio::runtime::Handle::current())
}

fn fast_params() -> RunnerParams {
    RunnerParams {
        input_interval: Duration::from_millis(20),
        flush_interval: Duration::from_millis(20),
        queue_size: 64,
    }
}

fn builder(name: &str) -> PipelineBuilder {
    PipelineBuilder::new(name, "proj", "store", tokio::runtime::Handle::current()).params(fast_params())
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..250 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5 seconds");
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_an_unknown_name_is_an_error() {
    let manager = manager_with_timeout(Duration::from_secs(1));
    let res = manager.stop("nope", true).await;
    assert!(matches!(res, Err(ManagerError::PipelineNotFound { .. })));
    assert!(manager.pipeline_names().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn starting_an_unstaged_name_is_an_error() {
    let manager = manager_with_timeout(Duration::from_secs(1));
    let res = manager.start("nope");
    assert!(matches!(res, Err(ManagerError::StagedMismatch { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_promotes_the_staged_pipeline_and_consumes_the_slot() {
    let manager = manager_with_timeout(Duration::from_secs(1));
    let pipeline = builder("cfg")
        .suffix("1")
        .metric_input("counting", Box::new(CountingInput::default()))
        .build()
        .unwrap();
    manager.stage(pipeline);

    manager.start("cfg/1").unwrap();
    assert!(manager.pipeline("cfg/1").is_some());
    let ctx = manager.runtime_context("cfg/1").unwrap();
    assert_eq!(ctx.project, "proj");

    // the slot was consumed the instant the pipeline was promoted
    let res = manager.start("cfg/1");
    assert!(matches!(res, Err(ManagerError::StagedMismatch { .. })));

    manager.stop("cfg/1", true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_timely_stop_removes_and_tears_down_the_pipeline() {
    let manager = manager_with_timeout(Duration::from_secs(5));
    let flusher = MemoryFlusher::default();
    let rounds = Arc::new(AtomicU64::new(0));
    let pipeline = builder("cfg")
        .metric_input(
            "counting",
            Box::new(CountingInput {
                rounds: Arc::clone(&rounds),
            }),
        )
        .flusher("memory", Box::new(flusher.clone()))
        .build()
        .unwrap();
    manager.stage(Arc::clone(&pipeline));
    manager.start("cfg").unwrap();

    // let at least one round flow through the pipeline
    wait_until(|| rounds.load(Ordering::SeqCst) >= 1).await;
    let runner = pipeline.runner().unwrap();

    manager.stop("cfg", true).await.unwrap();
    assert!(manager.pipeline("cfg").is_none());
    assert_eq!(manager.disabled_count(), 0);

    // every back-reference is gone, the graph is collectible
    assert!(runner.detached());
    assert!(pipeline.runner().is_none());
    assert!(pipeline.context().is_none());

    // the collected events reached the flusher before teardown
    assert!(!flusher.batches.lock().unwrap().is_empty());

    // deleted rather than disabled: nothing is retained
    assert!(manager.last_unsent_runner("cfg").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_slow_stop_quarantines_the_pipeline_until_it_finishes() {
    let manager = manager_with_timeout(Duration::from_millis(100));
    let gate = Arc::new(Gate::default());
    let pipeline = builder("cfg")
        .service_input("slow", Box::new(SlowStopService::new(Arc::clone(&gate))))
        .build()
        .unwrap();
    manager.stage(Arc::clone(&pipeline));
    manager.start("cfg").unwrap();
    let runner = pipeline.runner().unwrap();

    // the caller gets control back at the deadline, and the operation
    // still reports success
    manager.stop("cfg", false).await.unwrap();
    assert!(manager.pipeline("cfg").is_none());
    assert_eq!(manager.disabled_count(), 1);
    assert!(!runner.detached());

    // once the background stop completes, the pipeline reconciles itself
    // without any further external call
    gate.release();
    wait_until(|| manager.disabled_count() == 0).await;
    assert!(runner.detached());

    // disabled rather than deleted: the runner is kept for inspection
    assert!(manager.last_unsent_runner("cfg").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn reloading_a_quarantined_config_does_not_conflate_generations() {
    let manager = manager_with_timeout(Duration::from_millis(100));
    let gate = Arc::new(Gate::default());
    let gen1 = builder("cfg")
        .suffix("1")
        .service_input("slow", Box::new(SlowStopService::new(Arc::clone(&gate))))
        .build()
        .unwrap();
    manager.stage(gen1);
    manager.start("cfg/1").unwrap();
    manager.stop("cfg/1", false).await.unwrap();
    assert_eq!(manager.disabled_count(), 1);

    // reload the same logical config while the old generation is quarantined
    let gen2 = builder("cfg")
        .suffix("2")
        .metric_input("counting", Box::new(CountingInput::default()))
        .build()
        .unwrap();
    manager.stage(gen2);
    manager.start("cfg/2").unwrap();
    assert!(manager.pipeline("cfg/2").is_some());

    // the old generation reconciles without touching the new one
    gate.release();
    wait_until(|| manager.disabled_count() == 0).await;
    assert!(manager.pipeline("cfg/2").is_some());

    manager.stop("cfg/2", true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_all_only_removes_matching_pipelines() {
    let manager = manager_with_timeout(Duration::from_secs(5));
    // p1 has no input stage, p2 does; one reload may stage both at once
    let p1 = builder("p1").build().unwrap();
    let p2 = builder("p2")
        .metric_input("counting", Box::new(CountingInput::default()))
        .build()
        .unwrap();
    manager.stage(p1);
    manager.stage(p2);
    manager.start("p1").unwrap();
    manager.start("p2").unwrap();

    manager.stop_all_pipelines(false).await.unwrap();
    assert!(manager.pipeline("p1").is_none());
    assert!(manager.pipeline("p2").is_some());

    manager.stop_all_pipelines(true).await.unwrap();
    assert!(manager.pipeline("p2").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_panicking_stop_does_not_unwind_into_the_caller() {
    let manager = manager_with_timeout(Duration::from_secs(5));
    let pipeline = builder("cfg")
        .service_input("panicky", Box::new(PanickyStopService))
        .build()
        .unwrap();
    manager.stage(pipeline);
    manager.start("cfg").unwrap();

    // the panic is contained at the pipeline boundary
    manager.stop("cfg", true).await.unwrap();
    assert!(manager.pipeline("cfg").is_none());
    assert_eq!(manager.disabled_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_tears_down_without_running_stop() {
    let manager = manager_with_timeout(Duration::from_millis(100));
    let pipeline = builder("cfg")
        .metric_input("counting", Box::new(CountingInput::default()))
        .build()
        .unwrap();
    manager.stage(Arc::clone(&pipeline));
    manager.start("cfg").unwrap();
    let runner = pipeline.runner().unwrap();

    manager.remove("cfg", true).unwrap();
    assert!(manager.pipeline("cfg").is_none());
    assert!(runner.detached());
    assert_eq!(manager.disabled_count(), 0);

    let res = manager.remove("cfg", true);
    assert!(matches!(res, Err(ManagerError::PipelineNotFound { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn metric_plugins_run_one_extra_round_under_a_throwaway_control() {
    let rounds = Arc::new(AtomicU64::new(0));
    let pipeline: Arc<Pipeline> =
        PipelineBuilder::new("cfg", "proj", "store", tokio::runtime::Handle::current())
            .params(RunnerParams {
                // far enough that only the immediate first round runs
                input_interval: Duration::from_secs(3600),
                flush_interval: Duration::from_millis(20),
                queue_size: 16,
            })
            .metric_input(
                "counting",
                Box::new(CountingInput {
                    rounds: Arc::clone(&rounds),
                }),
            )
            .build()
            .unwrap();
    pipeline.start().unwrap();
    wait_until(|| rounds.load(Ordering::SeqCst) == 1).await;

    // this is the shutdown force-collect path: one full round runs even
    // though the control is cancelled immediately
    let control = AsyncControl::new(tokio::runtime::Handle::current());
    pipeline.runner().unwrap().run_plugins(PluginKind::MetricInput, &control);
    control.cancel_and_wait().await;
    assert!(rounds.load(Ordering::SeqCst) >= 2);

    let stopping = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || stopping.stop(true))
        .await
        .unwrap()
        .unwrap();
}
