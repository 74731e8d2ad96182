//! The always-on pipelines owned by the agent itself.
//!
//! Two builtin pipelines report the agent's own health: one for alarm/self
//! metrics, one for container metrics. They are built from fixed templates
//! at init, live as long as the agent, and are never subject to user reload.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indoc::indoc;
use serde::Deserialize;
use tokio::runtime;

use crate::control::AsyncControl;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::plugin::PluginKind;
use crate::plugin::selfmetrics::{AlarmMetricInput, ContainerMetricInput};
use crate::runner::RunnerParams;
use crate::util::panic::payload_str;

const ALARM_TEMPLATE: &str = indoc! {r#"
    [global]
    input_interval = "30s"
    flush_interval = "1s"
    queue_size = 4

    [[inputs]]
    type = "metric_alarm"
"#};

const CONTAINER_TEMPLATE: &str = indoc! {r#"
    [global]
    input_interval = "30s"
    flush_interval = "1s"
    queue_size = 4

    [[inputs]]
    type = "metric_container"
"#};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Template {
    global: GlobalParams,
    #[serde(default)]
    inputs: Vec<InputSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalParams {
    #[serde(with = "humantime_serde")]
    input_interval: Duration,
    #[serde(with = "humantime_serde")]
    flush_interval: Duration,
    queue_size: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InputSpec {
    #[serde(rename = "type")]
    kind: String,
}

/// Builds and starts one builtin pipeline from its template.
fn load_builtin(
    name: &str,
    project: &str,
    logstore: &str,
    template: &str,
    rt: &runtime::Handle,
) -> anyhow::Result<Arc<Pipeline>> {
    let template: Template =
        toml::from_str(template).with_context(|| format!("invalid builtin template for '{name}'"))?;
    let mut builder = PipelineBuilder::new(name, project, logstore, rt.clone()).params(RunnerParams {
        input_interval: template.global.input_interval,
        flush_interval: template.global.flush_interval,
        queue_size: template.global.queue_size,
    });
    for input in &template.inputs {
        builder = match input.kind.as_str() {
            "metric_alarm" => builder.metric_input(input.kind.clone(), Box::new(AlarmMetricInput::new())),
            "metric_container" => builder.metric_input(input.kind.clone(), Box::new(ContainerMetricInput::new())),
            other => anyhow::bail!("unknown builtin input type '{other}' in template '{name}'"),
        };
    }
    let pipeline = builder.build()?;
    pipeline.start()?;
    Ok(pipeline)
}

pub(crate) struct BuiltinPipelines {
    alarm: Arc<Pipeline>,
    container: Arc<Pipeline>,
}

impl BuiltinPipelines {
    /// Builds and starts both builtin pipelines. Any failure is fatal to the
    /// agent's init.
    pub(crate) fn load(rt: &runtime::Handle) -> anyhow::Result<Self> {
        let alarm = load_builtin("agent_alarm", "agent-admin", "agent_alarm", ALARM_TEMPLATE, rt)
            .context("failed to load the alarm pipeline")?;
        let container = load_builtin(
            "agent_containers",
            "agent-admin",
            "agent_containers",
            CONTAINER_TEMPLATE,
            rt,
        )
        .context("failed to load the container pipeline")?;
        log::info!("builtin pipelines loaded");
        Ok(Self { alarm, container })
    }

    /// Stops both builtin pipelines.
    ///
    /// With `force_self_collect`, each pipeline's input stage runs one more
    /// round under a throwaway control first, so a final snapshot of the
    /// agent's health is emitted before the process exits.
    pub(crate) async fn stop(self, force_self_collect: bool) {
        for pipeline in [self.alarm, self.container] {
            if force_self_collect {
                if let (Some(runner), Some(ctx)) = (pipeline.runner(), pipeline.context()) {
                    log::info!("force collecting {} before shutdown", pipeline.name());
                    let control = AsyncControl::new(ctx.runtime().clone());
                    runner.run_plugins(PluginKind::MetricInput, &control);
                    control.cancel_and_wait().await;
                }
            }
            let stopping = Arc::clone(&pipeline);
            match tokio::task::spawn_blocking(move || stopping.stop(true)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("failed to stop builtin pipeline {}: {e:#}", pipeline.name()),
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    log::error!(
                        "PLUGIN_RUNTIME_ALARM: stop of builtin pipeline {} panicked: {}",
                        pipeline.name(),
                        payload_str(payload.as_ref())
                    );
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ALARM_TEMPLATE, CONTAINER_TEMPLATE, Template, load_builtin};

    #[test]
    fn the_builtin_templates_parse() {
        for template in [ALARM_TEMPLATE, CONTAINER_TEMPLATE] {
            let parsed: Template = toml::from_str(template).expect("builtin template should be valid");
            assert_eq!(parsed.inputs.len(), 1);
        }
    }

    #[test]
    fn unknown_input_types_fail_the_load() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let template = r#"
            [global]
            input_interval = "30s"
            flush_interval = "1s"
            queue_size = 4

            [[inputs]]
            type = "metric_nonexistent"
        "#;
        let res = load_builtin("bad", "proj", "store", template, rt.handle());
        let err = format!("{:#}", res.unwrap_err());
        assert!(err.contains("metric_nonexistent"), "unexpected error: {err}");
    }

    #[test]
    fn malformed_templates_fail_the_load() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let res = load_builtin("bad", "proj", "store", "not toml at all [", rt.handle());
        assert!(res.is_err());
    }

    #[test]
    fn loaded_builtins_start_and_stop_cleanly() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = load_builtin("alarm", "proj", "store", ALARM_TEMPLATE, rt.handle()).unwrap();
        assert!(pipeline.is_with_input());
        pipeline.stop(true).unwrap();
    }
}
