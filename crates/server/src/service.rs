//! Run orchestration: CreateRun through terminal verdict.
//!
//! The service owns the sealed plugin registry, the run registry, and the
//! persistence sink. Creating a run parses and validates synchronously,
//! registers the run, and spawns the workflow; everything downstream (log
//! fan-out, projections, the final verdict line) flows through the sinks
//! wired here.

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use rocketship_engine::{
    LocalHost, LogSink, PluginRegistry, RunContext, RunOutcome, StepObserver, StepScope,
    WorkflowConfig, local_host_for_run, parse_suite, run_suite, validate_suite,
};
use rocketship_types::{LogColor, LogLine, RunStatus, RunSummary, StepResult, Suite};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::persistence::{
    CLEANUP_TEST_INDEX, INIT_TEST_INDEX, PersistenceSink, ProjectionEvent, RunRecord, StepRecord,
    TestRecord,
};
use crate::registry::RunRegistry;

/// A CreateRun request after transport decoding.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CreateRunRequest {
    /// Suite document, possibly multi-document YAML.
    pub suite_yaml: String,
    /// Environment overrides layered over the suite's `env` mapping.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variable overrides deep-merged over the suite's `vars` mapping.
    #[serde(default)]
    pub vars: JsonValue,
    /// Who asked for this run, recorded in the run projection.
    #[serde(default)]
    pub initiator: String,
}

/// The engine service behind the RPC surface.
pub struct EngineService {
    plugins: Arc<PluginRegistry>,
    runs: Arc<RunRegistry>,
    persistence: PersistenceSink,
    hosts: Arc<DashMap<String, Arc<LocalHost>>>,
    workflow_config: WorkflowConfig,
}

impl EngineService {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        runs: Arc<RunRegistry>,
        persistence: PersistenceSink,
        workflow_config: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            runs,
            persistence,
            hosts: Arc::new(DashMap::new()),
            workflow_config,
        })
    }

    /// Parse, validate, register, and start a run. Returns immediately with
    /// the new run id; execution continues in the background.
    pub fn create_run(&self, request: CreateRunRequest) -> ApiResult<String> {
        let suite = parse_suite(&request.suite_yaml).map_err(ApiError::from)?;
        let issues = validate_suite(&suite, &self.plugins.names());
        if !issues.is_empty() {
            return Err(ApiError::validation(issues));
        }

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        self.runs.create(&run_id, &suite.name, started_at);
        self.persistence.record(ProjectionEvent::Run(RunRecord {
            run_id: run_id.clone(),
            suite_name: suite.name.clone(),
            status: RunStatus::Pending,
            started_at,
            ended_at: None,
            trigger: "api".to_string(),
            initiator: request.initiator.clone(),
        }));

        let context = build_context(&run_id, &suite, &request);
        let sink: Arc<dyn LogSink> = Arc::new(RunLogSink {
            run_id: run_id.clone(),
            runs: Arc::clone(&self.runs),
            persistence: self.persistence.clone(),
        });
        let observer: Arc<dyn StepObserver> = Arc::new(RunStepObserver {
            run_id: run_id.clone(),
            suite: suite.clone(),
            persistence: self.persistence.clone(),
        });
        let host = Arc::new(local_host_for_run(
            run_id.clone(),
            Arc::clone(&self.plugins),
            sink,
            observer,
        ));
        self.hosts.insert(run_id.clone(), Arc::clone(&host));

        tokio::spawn(drive_run(
            RunDriver {
                runs: Arc::clone(&self.runs),
                persistence: self.persistence.clone(),
                hosts: Arc::clone(&self.hosts),
                workflow_config: self.workflow_config.clone(),
            },
            run_id.clone(),
            suite,
            context,
            host,
        ));

        Ok(run_id)
    }

    /// Worker-side log ingress: fan out and persist one line.
    pub fn add_log(&self, run_id: &str, line: LogLine) -> ApiResult<()> {
        if self.runs.get(run_id).is_none() {
            return Err(ApiError::not_found(format!("unknown run '{run_id}'")));
        }
        self.runs.append(run_id, line.clone());
        self.persistence.record(ProjectionEvent::Log {
            run_id: run_id.to_string(),
            line,
        });
        Ok(())
    }

    /// Subscribe to a run's log stream.
    pub fn stream_logs(&self, run_id: &str) -> ApiResult<mpsc::Receiver<LogLine>> {
        self.runs
            .subscribe(run_id)
            .ok_or_else(|| ApiError::not_found(format!("unknown run '{run_id}'")))
    }

    /// Deliver the cancellation token to a running workflow.
    pub fn cancel(&self, run_id: &str) -> ApiResult<()> {
        match self.hosts.get(run_id) {
            Some(host) => {
                warn!(run_id = %run_id, "cancellation requested");
                host.cancel();
                Ok(())
            }
            None => match self.runs.get(run_id) {
                // Terminal runs accept a cancel as a no-op.
                Some(_) => Ok(()),
                None => Err(ApiError::not_found(format!("unknown run '{run_id}'"))),
            },
        }
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        self.runs.list()
    }

    pub fn get_run(&self, run_id: &str) -> ApiResult<RunSummary> {
        self.runs
            .get(run_id)
            .ok_or_else(|| ApiError::not_found(format!("unknown run '{run_id}'")))
    }
}

/// The handles one background run needs after `create_run` returns.
struct RunDriver {
    runs: Arc<RunRegistry>,
    persistence: PersistenceSink,
    hosts: Arc<DashMap<String, Arc<LocalHost>>>,
    workflow_config: WorkflowConfig,
}

async fn drive_run(
    driver: RunDriver,
    run_id: String,
    suite: Suite,
    context: RunContext,
    host: Arc<LocalHost>,
) {
    info!(run_id = %run_id, suite = %suite.name, "run started");
    driver.runs.set_status(&run_id, RunStatus::Running, None);

    let outcome = run_suite(host.clone(), &suite, context, &driver.workflow_config).await;

    finish_run(&driver, &run_id, &suite, &outcome);
    driver.hosts.remove(&run_id);
    info!(run_id = %run_id, status = %outcome.status, "run finished");
}

fn finish_run(driver: &RunDriver, run_id: &str, suite: &Suite, outcome: &RunOutcome) {
    for (test_index, test) in outcome.tests.iter().enumerate() {
        let status = if test.skipped {
            "SKIPPED"
        } else if test.passed {
            "PASSED"
        } else {
            "FAILED"
        };
        driver.persistence.record(ProjectionEvent::Test(TestRecord {
            run_id: run_id.to_string(),
            test_index: test_index as i32,
            name: test.name.clone(),
            status: status.to_string(),
        }));
    }

    let append = |line: LogLine| {
        driver.runs.append(run_id, line.clone());
        driver.persistence.record(ProjectionEvent::Log {
            run_id: run_id.to_string(),
            line,
        });
    };

    if outcome.cleanup.timed_out {
        append(
            LogLine::info(Utc::now(), "cleanup phase timed out; verdict unchanged")
                .colored(LogColor::Red)
                .bolded(),
        );
    }

    let (color, summary) = match outcome.status {
        RunStatus::Passed => (LogColor::Green, "run PASSED".to_string()),
        RunStatus::Cancelled => (LogColor::Red, "run CANCELLED".to_string()),
        _ => {
            let failed = outcome
                .tests
                .iter()
                .filter(|test| !test.skipped && !test.passed)
                .count();
            (LogColor::Red, format!("run FAILED ({failed} failing test(s))"))
        }
    };
    append(LogLine::info(Utc::now(), summary).colored(color).bolded());

    let ended_at = Utc::now();
    let started_at = driver
        .runs
        .get(run_id)
        .map(|summary| summary.started_at)
        .unwrap_or(ended_at);
    driver.runs.set_status(run_id, outcome.status, Some(ended_at));
    driver.persistence.record(ProjectionEvent::Run(RunRecord {
        run_id: run_id.to_string(),
        suite_name: suite.name.clone(),
        status: outcome.status,
        started_at,
        ended_at: Some(ended_at),
        trigger: "api".to_string(),
        initiator: String::new(),
    }));
}

/// Compose the run context: process env snapshot, suite env with request
/// overrides, suite vars deep-merged with request overrides.
fn build_context(run_id: &str, suite: &Suite, request: &CreateRunRequest) -> RunContext {
    let system_env: HashMap<String, String> = std::env::vars().collect();

    let mut env: HashMap<String, String> = suite
        .env
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    env.extend(request.env.clone());

    let mut vars = vars_to_value(&suite.vars);
    if request.vars.is_object() {
        deep_merge(&mut vars, &request.vars);
    }

    RunContext::new(run_id, system_env, env, vars)
}

fn vars_to_value(vars: &IndexMap<String, JsonValue>) -> JsonValue {
    let mut map = serde_json::Map::new();
    for (key, value) in vars {
        map.insert(key.clone(), value.clone());
    }
    JsonValue::Object(map)
}

/// Overlay `overrides` onto `base`; nested objects merge, everything else
/// replaces.
fn deep_merge(base: &mut JsonValue, overrides: &JsonValue) {
    match (base, overrides) {
        (JsonValue::Object(base_map), JsonValue::Object(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && override_value.is_object() => {
                        deep_merge(base_value, override_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), override_value.clone());
                    }
                }
            }
        }
        (base_slot, _) => *base_slot = overrides.clone(),
    }
}

/// Log sink bound to one run: registry fan-out plus the log store.
struct RunLogSink {
    run_id: String,
    runs: Arc<RunRegistry>,
    persistence: PersistenceSink,
}

impl LogSink for RunLogSink {
    fn emit(&self, line: LogLine) {
        self.runs.append(&self.run_id, line.clone());
        self.persistence.record(ProjectionEvent::Log {
            run_id: self.run_id.clone(),
            line,
        });
    }
}

/// Step observer bound to one run: projects step results as they complete.
struct RunStepObserver {
    run_id: String,
    suite: Suite,
    persistence: PersistenceSink,
}

impl StepObserver for RunStepObserver {
    fn on_step(&self, scope: &StepScope, result: &StepResult) {
        let test_index = match scope.phase.as_str() {
            "init" => INIT_TEST_INDEX,
            "cleanup" => CLEANUP_TEST_INDEX,
            _ => scope.test_index.map(|index| index as i32).unwrap_or(INIT_TEST_INDEX),
        };
        let (name, config) = self
            .step_definition(scope)
            .map(|step| (step.name.clone(), step.config.clone()))
            .unwrap_or((String::new(), JsonValue::Null));
        self.persistence
            .record(ProjectionEvent::Step(StepRecord::from_result(
                &self.run_id,
                test_index,
                scope.step_index as i32,
                &name,
                &config,
                result,
            )));
    }
}

impl RunStepObserver {
    fn step_definition(&self, scope: &StepScope) -> Option<&rocketship_types::Step> {
        match scope.phase.as_str() {
            "init" => self.suite.init.get(scope.step_index),
            "cleanup" => {
                let on_failure_len = self.suite.cleanup.on_failure.len();
                if scope.step_index < on_failure_len {
                    self.suite.cleanup.on_failure.get(scope.step_index)
                } else {
                    self.suite.cleanup.always.get(scope.step_index - on_failure_len)
                }
            }
            _ => self
                .suite
                .tests
                .get(scope.test_index?)
                .and_then(|test| test.steps.get(scope.step_index)),
        }
    }
}
