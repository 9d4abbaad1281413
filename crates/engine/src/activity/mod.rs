//! The step activity: end-to-end execution of one step.
//!
//! Rendering, plugin dispatch, assertion evaluation, and save resolution all
//! happen here, on the worker side of the activity boundary. The workflow
//! only ever sees the returned [`StepResult`].

mod assertions;
mod saves;

pub use assertions::evaluate_assertions;
pub use saves::{ResolvedSaves, resolve_saves};

use chrono::Utc;
use rocketship_types::{
    Assertion, ErrorKind, KnownAssertion, LogColor, LogLine, Step, StepError, StepResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;

use crate::context::RunContext;
use crate::host::ActivityHandler;
use crate::plugin::{ActivityContext, PluginParams, PluginRegistry};
use crate::template::render_value;

/// Where a step sits inside its run, for logging and persistence keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepScope {
    /// `init`, `test`, or `cleanup`.
    pub phase: String,
    /// Index of the owning test; `None` outside the tests phase.
    pub test_index: Option<usize>,
    /// Index of the step within its sequence.
    pub step_index: usize,
    /// Label attached to log lines; empty outside the tests phase.
    pub test_name: String,
}

impl StepScope {
    pub fn init(step_index: usize) -> Self {
        Self {
            phase: "init".to_string(),
            test_index: None,
            step_index,
            test_name: String::new(),
        }
    }

    pub fn test(test_index: usize, step_index: usize, test_name: impl Into<String>) -> Self {
        Self {
            phase: "test".to_string(),
            test_index: Some(test_index),
            step_index,
            test_name: test_name.into(),
        }
    }

    pub fn cleanup(step_index: usize) -> Self {
        Self {
            phase: "cleanup".to_string(),
            test_index: None,
            step_index,
            test_name: String::new(),
        }
    }
}

/// Serializable input of one step activity invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepActivityInput {
    pub step: Step,
    pub context: RunContext,
    pub scope: StepScope,
}

/// Sink for structured log lines bound to a run.
///
/// Implementations must not block: lines are enqueued, never awaited.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: LogLine);
}

/// A sink that drops everything, for tests and detached tooling.
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _line: LogLine) {}
}

/// Observer invoked with every terminal step result, the projection hook the
/// persistence layer attaches to.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, scope: &StepScope, result: &StepResult);
}

/// An observer that ignores everything.
pub struct NullObserver;

impl StepObserver for NullObserver {
    fn on_step(&self, _scope: &StepScope, _result: &StepResult) {}
}

/// Executes steps against a sealed plugin registry.
pub struct StepActivity {
    registry: Arc<PluginRegistry>,
    sink: Arc<dyn LogSink>,
    observer: Arc<dyn StepObserver>,
}

impl StepActivity {
    pub fn new(
        registry: Arc<PluginRegistry>,
        sink: Arc<dyn LogSink>,
        observer: Arc<dyn StepObserver>,
    ) -> Self {
        Self {
            registry,
            sink,
            observer,
        }
    }

    /// Execute one step end to end, returning its canonical result.
    ///
    /// Emits one start line and one completion line through the sink, and
    /// forwards any plugin-emitted lines in between. Never panics and never
    /// returns transport errors: every failure mode is folded into the
    /// result so the workflow can classify it.
    pub async fn execute(&self, ctx: &ActivityContext, input: &StepActivityInput) -> StepResult {
        let scope = &input.scope;
        let step_name = input.step.name.clone();
        self.emit(
            scope,
            &step_name,
            LogLine::info(Utc::now(), format!("step '{step_name}' started")),
        );

        let result = self.run_inner(ctx, input).await;

        let completion = match (&result.ok, &result.error) {
            (true, _) => LogLine::info(
                Utc::now(),
                format!("step '{step_name}' passed ({}ms)", result.duration_ms),
            )
            .colored(LogColor::Green),
            (false, Some(error)) => LogLine::info(
                Utc::now(),
                format!("step '{step_name}' failed: {}: {}", error.kind, error.message),
            )
            .colored(LogColor::Red),
            (false, None) => LogLine::info(Utc::now(), format!("step '{step_name}' failed"))
                .colored(LogColor::Red),
        };
        self.emit(scope, &step_name, completion);

        self.observer.on_step(scope, &result);
        result
    }

    async fn run_inner(&self, ctx: &ActivityContext, input: &StepActivityInput) -> StepResult {
        let step = &input.step;
        let context = &input.context;
        let mut result = StepResult {
            plugin: step.plugin.clone(),
            ..StepResult::default()
        };

        let config = match render_value(&step.config, context) {
            Ok(config) => config,
            Err(error) => return failed(result, error.kind, error.message),
        };
        let assertions = match render_assertions(&step.assertions, context) {
            Ok(assertions) => assertions,
            Err(error) => return failed(result, error.kind, error.message),
        };

        let Some(plugin) = self.registry.get(&step.plugin) else {
            return failed(
                result,
                ErrorKind::UnknownPlugin,
                format!(
                    "plugin '{}' is not registered; registered plugins: {}",
                    step.plugin,
                    self.registry.names().join(", ")
                ),
            );
        };

        let params = PluginParams {
            config,
            assertions: assertions.clone(),
            save: step.save.clone(),
            state: context.state_snapshot(),
            env: context.env_snapshot(),
            run: context.run_id().to_string(),
        };

        let started = Instant::now();
        let outcome = match plugin.execute(ctx, &params).await {
            Ok(outcome) => outcome,
            Err(error) => {
                result.duration_ms = started.elapsed().as_millis() as u64;
                return failed(result, error.kind, error.message);
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.request_data = outcome.request_data;
        result.response_data = outcome.response_data;

        for line in &outcome.logs {
            self.emit(
                &input.scope,
                &step.name,
                LogLine::info(Utc::now(), line.clone()).colored(LogColor::Purple),
            );
        }

        if output_is_empty(&outcome.output) {
            return failed(
                result,
                ErrorKind::PluginError,
                format!("PLUGIN_EMPTY_OUTPUT: plugin '{}' returned no output", step.plugin),
            );
        }
        result.output = outcome.output;

        result.assertion_results = evaluate_assertions(&assertions, &result.output);
        if let Some(first_failure) = result.assertion_results.iter().find(|outcome| !outcome.passed)
        {
            let message = format!(
                "assertion '{}' failed: {}",
                first_failure.kind,
                first_failure
                    .message
                    .clone()
                    .unwrap_or_else(|| "mismatch".to_string())
            );
            // A failing assertion blocks saves: nothing from this step enters
            // the runtime scope.
            return failed(result, ErrorKind::AssertionFailed, message);
        }

        match resolve_saves(&step.save, &result.output) {
            Ok(resolved) => {
                for name in &resolved.missing_optional {
                    self.emit(
                        &input.scope,
                        &step.name,
                        LogLine::info(Utc::now(), format!("optional save '{name}' did not resolve")),
                    );
                }
                result.saved = resolved.values;
            }
            Err(error) => return failed(result, error.kind, error.message),
        }

        result.ok = true;
        result
    }

    fn emit(&self, scope: &StepScope, step_name: &str, line: LogLine) {
        self.sink.emit(line.scoped(scope.test_name.clone(), step_name.to_string()));
    }
}

/// Adapter registering a [`StepActivity`] as the host's `step` activity.
pub struct StepActivityHandler {
    activity: StepActivity,
}

impl StepActivityHandler {
    pub fn new(activity: StepActivity) -> Self {
        Self { activity }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for StepActivityHandler {
    async fn call(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, rocketship_types::EngineError> {
        let input: StepActivityInput = serde_json::from_value(input).map_err(|error| {
            rocketship_types::EngineError::internal(format!("malformed step activity input: {error}"))
        })?;
        let result = self.activity.execute(&ctx, &input).await;
        serde_json::to_value(result).map_err(|error| {
            rocketship_types::EngineError::internal(format!("failed to encode step result: {error}"))
        })
    }
}

fn failed(mut result: StepResult, kind: ErrorKind, message: impl Into<String>) -> StepResult {
    result.ok = false;
    result.error = Some(StepError {
        kind,
        message: message.into(),
    });
    result
}

fn output_is_empty(output: &JsonValue) -> bool {
    match output {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Render the `expected` side of every assertion against the current scope.
fn render_assertions(
    assertions: &[Assertion],
    context: &RunContext,
) -> Result<Vec<Assertion>, rocketship_types::EngineError> {
    assertions
        .iter()
        .map(|assertion| render_assertion(assertion, context))
        .collect()
}

fn render_assertion(
    assertion: &Assertion,
    context: &RunContext,
) -> Result<Assertion, rocketship_types::EngineError> {
    let rendered = match assertion {
        Assertion::Known(known) => Assertion::Known(match known {
            KnownAssertion::StatusCode { expected } => KnownAssertion::StatusCode {
                expected: render_value(expected, context)?,
            },
            KnownAssertion::JsonPath { path, expected, exists } => KnownAssertion::JsonPath {
                path: path.clone(),
                expected: expected
                    .as_ref()
                    .map(|value| render_value(value, context))
                    .transpose()?,
                exists: *exists,
            },
            KnownAssertion::Header { name, expected } => KnownAssertion::Header {
                name: name.clone(),
                expected: render_value(expected, context)?,
            },
            KnownAssertion::RowCount { expected } => KnownAssertion::RowCount {
                expected: render_value(expected, context)?,
            },
            KnownAssertion::ColumnValue { column, row, expected } => KnownAssertion::ColumnValue {
                column: column.clone(),
                row: *row,
                expected: render_value(expected, context)?,
            },
            KnownAssertion::SupabaseCount { expected } => KnownAssertion::SupabaseCount {
                expected: render_value(expected, context)?,
            },
        }),
        Assertion::Plugin(plugin_assertion) => {
            let mut rendered_config = plugin_assertion.config.clone();
            for value in rendered_config.values_mut() {
                *value = render_value(value, context)?;
            }
            Assertion::Plugin(rocketship_types::PluginAssertion {
                kind: plugin_assertion.kind.clone(),
                config: rendered_config,
            })
        }
    };
    Ok(rendered)
}
