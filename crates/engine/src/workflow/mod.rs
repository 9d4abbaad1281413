//! The suite workflow: a deterministic state machine that drives one suite
//! from `PENDING` to a terminal verdict.
//!
//! Phase ordering is strict: init steps run sequentially and their saves
//! freeze into a scope shared by every test; tests fan out up to the
//! configured limit, each on a forked context; cleanup runs `on_failure`
//! (when something failed) then `always`, under a hard wall-clock ceiling.
//! All non-determinism flows through the [`WorkflowHost`] SPI, so the same
//! code replays byte-for-byte against a recorded history.

mod retry;

pub use retry::RetrySchedule;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rocketship_types::{ErrorKind, RunStatus, Step, StepError, StepResult, Suite};
use rocketship_util::parse_duration;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::activity::{StepActivityInput, StepScope};
use crate::context::RunContext;
use crate::host::{ActivityOptions, WorkflowHost};

/// Name the step activity registers under on every host.
pub const STEP_ACTIVITY: &str = "step";

/// Engine-level execution knobs for one run.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How many tests may run concurrently. Tests at the same nesting level
    /// are independent by contract.
    pub test_fan_out: usize,
    /// Activity timeout applied when a step config carries no `timeout`.
    pub default_step_timeout: Duration,
    /// Hard wall-clock ceiling on the combined cleanup phase.
    pub cleanup_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            test_fan_out: 1,
            default_step_timeout: Duration::from_secs(5 * 60),
            cleanup_timeout: Duration::from_secs(45 * 60),
        }
    }
}

/// One executed step and its position label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub name: String,
    pub result: StepResult,
}

/// Outcome of one test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub name: String,
    /// True when every executed step succeeded.
    pub passed: bool,
    /// True when the test never started (init failure or cancellation).
    pub skipped: bool,
    pub steps: Vec<StepOutcome>,
}

/// Outcome of the cleanup phase. Never alters the run verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CleanupOutcome {
    pub ran_on_failure: bool,
    pub timed_out: bool,
    pub steps: Vec<StepOutcome>,
}

/// Terminal record of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub init: Vec<StepOutcome>,
    pub tests: Vec<TestOutcome>,
    pub cleanup: CleanupOutcome,
    /// The frozen init scope, for inspection and persistence.
    pub init_saved: HashMap<String, String>,
}

/// Drive a validated suite to a terminal verdict.
pub async fn run_suite(
    host: Arc<dyn WorkflowHost>,
    suite: &Suite,
    base: RunContext,
    config: &WorkflowConfig,
) -> RunOutcome {
    let mut init_outcomes = Vec::new();
    let mut init_failed = false;
    let mut cancelled = false;

    // init: sequential, saves accumulate into the shared scope. The first
    // failure short-circuits the phase and skips the tests entirely.
    let mut init_ctx = base.fork_for_test();
    for (step_index, step) in suite.init.iter().enumerate() {
        if host.is_cancelled() {
            cancelled = true;
            break;
        }
        let scope = StepScope::init(step_index);
        let result = run_step_with_retry(host.as_ref(), step, &init_ctx, &scope, config).await;
        if result.ok {
            init_ctx.save_all(result.saved.clone().into_iter());
        } else {
            if step_error_kind(&result) == Some(ErrorKind::Cancelled) {
                cancelled = true;
            }
            init_failed = true;
        }
        init_outcomes.push(StepOutcome {
            name: step.name.clone(),
            result,
        });
        if init_failed || cancelled {
            break;
        }
    }

    let init_saved = init_ctx.runtime().clone();
    let shared = base.with_init_scope(init_saved.clone());

    // tests: independent, fanned out up to the configured limit, each on its
    // own context fork. Results are reassembled in declaration order.
    let mut test_outcomes: Vec<TestOutcome> = suite
        .tests
        .iter()
        .map(|test| TestOutcome {
            name: test.name.clone(),
            passed: false,
            skipped: true,
            steps: Vec::new(),
        })
        .collect();

    if !init_failed && !cancelled {
        let fan_out = config.test_fan_out.max(1);
        let mut pending = suite.tests.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < fan_out {
                if host.is_cancelled() {
                    break;
                }
                let Some((test_index, test)) = pending.next() else {
                    break;
                };
                let host = Arc::clone(&host);
                let ctx = shared.fork_for_test();
                let config = config.clone();
                in_flight.push(async move {
                    let outcome = run_test(host.as_ref(), test_index, test, ctx, &config).await;
                    (test_index, outcome)
                });
            }

            match in_flight.next().await {
                Some((test_index, outcome)) => {
                    test_outcomes[test_index] = outcome;
                }
                None => break,
            }
        }

        cancelled |= host.is_cancelled();
    }

    let any_failed = init_failed
        || test_outcomes
            .iter()
            .any(|outcome| !outcome.skipped && !outcome.passed);

    // cleanup: sees init scope plus a synthesized summary of outcomes, never
    // per-test runtime values.
    let verdict = if cancelled {
        RunStatus::Cancelled
    } else if any_failed {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    };
    let cleanup_ctx = shared.fork_with_runtime(summary_entries(&test_outcomes, verdict));
    let cleanup = run_cleanup(&host, suite, any_failed, cleanup_ctx, config).await;

    RunOutcome {
        status: verdict,
        init: init_outcomes,
        tests: test_outcomes,
        cleanup,
        init_saved,
    }
}

/// Execute one test: a sequential chain of steps on a private context fork.
///
/// A failed step marks the test failed but does not stop the chain; later
/// steps run with whatever scope exists (their renders may fail, which is
/// itself a recorded failure).
async fn run_test(
    host: &dyn WorkflowHost,
    test_index: usize,
    test: &rocketship_types::TestSpec,
    mut ctx: RunContext,
    config: &WorkflowConfig,
) -> TestOutcome {
    let mut steps = Vec::new();
    let mut passed = true;

    for (step_index, step) in test.steps.iter().enumerate() {
        if host.is_cancelled() {
            passed = false;
            break;
        }
        let scope = StepScope::test(test_index, step_index, test.name.clone());
        let result = run_step_with_retry(host, step, &ctx, &scope, config).await;
        if result.ok {
            ctx.save_all(result.saved.clone().into_iter());
        } else {
            passed = false;
        }
        let was_cancelled = step_error_kind(&result) == Some(ErrorKind::Cancelled);
        steps.push(StepOutcome {
            name: step.name.clone(),
            result,
        });
        if was_cancelled {
            break;
        }
    }

    TestOutcome {
        name: test.name.clone(),
        passed,
        skipped: false,
        steps,
    }
}

/// Execute one step under its retry policy.
async fn run_step_with_retry(
    host: &dyn WorkflowHost,
    step: &Step,
    ctx: &RunContext,
    scope: &StepScope,
    config: &WorkflowConfig,
) -> StepResult {
    let schedule = RetrySchedule::new(step.retry.as_ref());
    let timeout = step
        .config
        .get("timeout")
        .and_then(JsonValue::as_str)
        .and_then(parse_duration)
        .unwrap_or(config.default_step_timeout);

    let mut attempt: u32 = 1;
    loop {
        let key = activity_key(scope, attempt);
        let input = StepActivityInput {
            step: step.clone(),
            context: ctx.clone(),
            scope: scope.clone(),
        };
        let input = match serde_json::to_value(&input) {
            Ok(value) => value,
            Err(error) => {
                return synthetic_failure(
                    step,
                    ErrorKind::Internal,
                    format!("failed to encode activity input: {error}"),
                );
            }
        };

        let mut options = ActivityOptions::new(key.clone(), timeout);
        if scope.phase == "cleanup" {
            options = options.detached();
        }
        let result = match host.execute_activity(STEP_ACTIVITY, input, options).await {
            Ok(value) => match serde_json::from_value::<StepResult>(value) {
                Ok(result) => result,
                Err(error) => synthetic_failure(
                    step,
                    ErrorKind::Internal,
                    format!("failed to decode activity output: {error}"),
                ),
            },
            Err(error) => synthetic_failure(step, error.kind, error.message),
        };

        if result.ok {
            return result;
        }
        let Some(error) = result.error.clone() else {
            return result;
        };
        if error.kind == ErrorKind::Cancelled {
            return result;
        }
        if attempt >= schedule.maximum_attempts() || !schedule.allows_retry(&error) {
            return result;
        }

        host.sleep(&format!("retry:{key}"), schedule.interval_after(attempt)).await;
        if host.is_cancelled() {
            return result;
        }
        attempt += 1;
    }
}

/// Execute the cleanup sequences under the hard wall-clock ceiling.
///
/// Step outcomes accumulate into shared storage so a ceiling hit reports the
/// steps that did complete; the in-flight activity is dropped cooperatively.
async fn run_cleanup(
    host: &Arc<dyn WorkflowHost>,
    suite: &Suite,
    any_failed: bool,
    ctx: RunContext,
    config: &WorkflowConfig,
) -> CleanupOutcome {
    if suite.cleanup.is_empty() {
        return CleanupOutcome::default();
    }

    let completed: Arc<Mutex<Vec<StepOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let work = {
        let completed = Arc::clone(&completed);
        let host = Arc::clone(host);
        let mut ctx = ctx;
        async move {
            // Step indices are stable positions in the declared sequences
            // (`on_failure` first, then `always`), whether or not the
            // failure branch executed.
            if any_failed {
                for (index, step) in suite.cleanup.on_failure.iter().enumerate() {
                    let scope = StepScope::cleanup(index);
                    let result =
                        run_step_with_retry(host.as_ref(), step, &ctx, &scope, config).await;
                    if result.ok {
                        ctx.save_all(result.saved.clone().into_iter());
                    }
                    if let Ok(mut outcomes) = completed.lock() {
                        outcomes.push(StepOutcome {
                            name: step.name.clone(),
                            result,
                        });
                    }
                }
            }
            let always_base = suite.cleanup.on_failure.len();
            for (index, step) in suite.cleanup.always.iter().enumerate() {
                let scope = StepScope::cleanup(always_base + index);
                let result = run_step_with_retry(host.as_ref(), step, &ctx, &scope, config).await;
                if result.ok {
                    ctx.save_all(result.saved.clone().into_iter());
                }
                if let Ok(mut outcomes) = completed.lock() {
                    outcomes.push(StepOutcome {
                        name: step.name.clone(),
                        result,
                    });
                }
            }
        }
    };

    let timed_out = tokio::select! {
        _ = work => false,
        _ = host.sleep("cleanup:ceiling", config.cleanup_timeout) => true,
    };

    let steps = completed
        .lock()
        .map(|outcomes| outcomes.clone())
        .unwrap_or_default();
    CleanupOutcome {
        ran_on_failure: any_failed && !suite.cleanup.on_failure.is_empty(),
        timed_out,
        steps,
    }
}

fn summary_entries(tests: &[TestOutcome], verdict: RunStatus) -> HashMap<String, String> {
    let passed = tests
        .iter()
        .filter(|outcome| !outcome.skipped && outcome.passed)
        .count();
    let failed = tests
        .iter()
        .filter(|outcome| !outcome.skipped && !outcome.passed)
        .count();
    let mut entries = HashMap::new();
    entries.insert("tests_passed".to_string(), passed.to_string());
    entries.insert("tests_failed".to_string(), failed.to_string());
    entries.insert("run_verdict".to_string(), verdict.to_string());
    entries
}

fn activity_key(scope: &StepScope, attempt: u32) -> String {
    let test_index = scope
        .test_index
        .map(|index| index.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}:{}:{}:attempt:{}",
        scope.phase, test_index, scope.step_index, attempt
    )
}

fn synthetic_failure(step: &Step, kind: ErrorKind, message: impl Into<String>) -> StepResult {
    StepResult {
        ok: false,
        plugin: step.plugin.clone(),
        error: Some(StepError {
            kind,
            message: message.into(),
        }),
        ..StepResult::default()
    }
}

fn step_error_kind(result: &StepResult) -> Option<ErrorKind> {
    result.error.as_ref().map(|error| error.kind)
}
