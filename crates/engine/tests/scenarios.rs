//! End-to-end workflow scenarios exercising chaining, isolation, retries,
//! cancellation, and the cleanup ceiling.

mod common;

use common::{CollectingSink, ScriptedCall, ScriptedPlugin, base_context, host_with_plugins};
use rocketship_engine::{WorkflowConfig, parse_suite, run_suite};
use rocketship_types::{ErrorKind, RunStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config_with_fan_out(fan_out: usize) -> WorkflowConfig {
    WorkflowConfig {
        test_fan_out: fan_out,
        ..WorkflowConfig::default()
    }
}

#[tokio::test]
async fn chained_steps_propagate_saved_values() {
    let suite = parse_suite(
        r#"
name: chained http
tests:
  - name: create then fetch
    steps:
      - name: create user
        plugin: http
        config:
          method: POST
          url: "https://api.example.com/users"
        save:
          - type: json_path
            path: ".id"
            as: user_id
      - name: fetch user
        plugin: http
        config:
          method: GET
          url: "https://api.example.com/users/{{ user_id }}"
        assertions:
          - type: status_code
            expected: 200
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new("http", ScriptedCall::Output(json!({"status_code": 200, "body": {}})));
    stub.enqueue(ScriptedCall::Output(json!({
        "status_code": 200,
        "body": {"id": "42"},
    })));

    let sink = CollectingSink::new();
    let host = host_with_plugins("run-chained", vec![stub.clone()], sink.clone());
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-chained"),
        &WorkflowConfig::default(),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Passed);
    let steps = &outcome.tests[0].steps;
    assert_eq!(steps[0].result.saved["user_id"], "42");
    // the second request rendered the saved value into its URL
    assert_eq!(
        stub.recorded_config(1)["url"],
        "https://api.example.com/users/42"
    );
}

#[tokio::test]
async fn failing_assertion_blocks_saves_and_downstream_renders_fail() {
    let suite = parse_suite(
        r#"
name: assertion gate
tests:
  - name: create then fetch
    steps:
      - name: create user
        plugin: http
        config:
          method: POST
          url: "https://api.example.com/users"
        assertions:
          - type: status_code
            expected: 201
        save:
          - type: json_path
            path: ".id"
            as: user_id
      - name: fetch user
        plugin: http
        config:
          url: "https://api.example.com/users/{{ user_id }}"
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new(
        "http",
        ScriptedCall::Output(json!({"status_code": 200, "body": {"id": "42"}})),
    );
    let sink = CollectingSink::new();
    let host = host_with_plugins("run-gate", vec![stub.clone()], sink);
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-gate"),
        &WorkflowConfig::default(),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    let steps = &outcome.tests[0].steps;

    let first_error = steps[0].result.error.as_ref().expect("step 1 error");
    assert_eq!(first_error.kind, ErrorKind::AssertionFailed);
    assert!(steps[0].result.saved.is_empty());

    // step 2 still executed; its render failed on the missing saved value
    assert_eq!(steps.len(), 2);
    let second_error = steps[1].result.error.as_ref().expect("step 2 error");
    assert_eq!(second_error.kind, ErrorKind::TemplateError);
    assert!(second_error.message.contains("user_id") || second_error.message.contains("(none)"));
    // the plugin was only dispatched once: step 2 never got past rendering
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn init_scope_is_shared_and_test_logs_stay_ordered() {
    let suite = parse_suite(
        r#"
name: shared base url
init:
  - name: discover base url
    plugin: http
    config:
      url: "https://registry.internal/resolve"
    save:
      - type: json_path
        path: ".base_url"
        as: base_url
tests:
  - name: first
    steps:
      - name: get first
        plugin: http
        config:
          url: "{{ base_url }}/x"
        assertions:
          - type: status_code
            expected: 200
  - name: second
    steps:
      - name: get second
        plugin: http
        config:
          url: "{{ base_url }}/x"
        assertions:
          - type: status_code
            expected: 200
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new("http", ScriptedCall::Output(json!({"status_code": 200, "body": {}})));
    stub.enqueue(ScriptedCall::Output(json!({
        "status_code": 200,
        "body": {"base_url": "https://svc.internal"},
    })));

    let sink = CollectingSink::new();
    let host = host_with_plugins("run-shared", vec![stub.clone()], sink.clone());
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-shared"),
        &config_with_fan_out(2),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Passed);
    assert_eq!(outcome.init_saved["base_url"], "https://svc.internal");
    assert!(outcome.tests.iter().all(|test| test.passed));

    // both tests rendered the init-produced value
    for call_index in 1..stub.call_count() {
        assert_eq!(stub.recorded_config(call_index)["url"], "https://svc.internal/x");
    }

    // each test's own lines stay ordered even under fan-out
    for test_name in ["first", "second"] {
        let lines = sink.lines_for_test(test_name);
        assert!(lines.len() >= 2, "expected start and completion for {test_name}");
        assert!(lines.first().expect("start").msg.contains("started"));
        assert!(lines.last().expect("completion").msg.contains("passed"));
    }
}

#[tokio::test]
async fn runtime_saves_never_cross_between_tests() {
    let suite = parse_suite(
        r#"
name: isolation
tests:
  - name: writer
    steps:
      - name: produce
        plugin: http
        config:
          url: "https://api.example.com/token"
        save:
          - type: json_path
            path: ".token"
            as: session_token
  - name: reader
    steps:
      - name: consume
        plugin: http
        config:
          url: "https://api.example.com/use/{{ session_token }}"
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new(
        "http",
        ScriptedCall::Output(json!({"status_code": 200, "body": {"token": "t-123"}})),
    );
    let sink = CollectingSink::new();
    let host = host_with_plugins("run-isolation", vec![stub], sink);
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-isolation"),
        &WorkflowConfig::default(),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.tests[0].passed, "writer saved its own value");
    let reader_error = outcome.tests[1].steps[0]
        .result
        .error
        .as_ref()
        .expect("reader error");
    assert_eq!(reader_error.kind, ErrorKind::TemplateError);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_backs_off_exponentially() {
    let suite = parse_suite(
        r#"
name: retry exhaustion
tests:
  - name: flaky
    steps:
      - name: always fails
        plugin: flaky
        config: {}
        retry:
          maximum_attempts: 3
          initial_interval: 100ms
          backoff_coefficient: 2
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new(
        "flaky",
        ScriptedCall::Fail(ErrorKind::PluginError, "connection reset".to_string()),
    );
    let sink = CollectingSink::new();
    let host = host_with_plugins("run-retry", vec![stub.clone()], sink);
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-retry"),
        &WorkflowConfig::default(),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(stub.call_count(), 3);

    // attempts land at t, t+100ms, t+300ms
    let offsets = stub.call_offsets_from_first();
    assert_eq!(offsets[0], Duration::ZERO);
    assert_eq!(offsets[1], Duration::from_millis(100));
    assert_eq!(offsets[2], Duration::from_millis(300));

    let error = outcome.tests[0].steps[0].result.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::PluginError);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_the_test_but_cleanup_always_runs() {
    let suite = parse_suite(
        r#"
name: cancel with cleanup
tests:
  - name: long running
    steps:
      - name: slow call
        plugin: slow
        config: {}
cleanup:
  always:
    - name: teardown
      plugin: delay
      config:
        duration: 2s
"#,
    )
    .expect("parse suite");

    let slow = ScriptedPlugin::new(
        "slow",
        ScriptedCall::SleepThen(Duration::from_secs(600), json!({"done": true})),
    );
    let sink = CollectingSink::new();
    let host = host_with_plugins("run-cancel", vec![slow, Arc::new(rocketship_engine::DelayPlugin)], sink);

    let workflow = {
        let host = host.clone();
        let suite = suite.clone();
        tokio::spawn(async move {
            run_suite(
                host,
                &suite,
                base_context("run-cancel"),
                &WorkflowConfig::default(),
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_secs(10)).await;
    host.cancel();
    let outcome = workflow.await.expect("join workflow");

    assert_eq!(outcome.status, RunStatus::Cancelled);
    let cancelled_step = &outcome.tests[0].steps[0].result;
    assert_eq!(
        cancelled_step.error.as_ref().expect("cancel error").kind,
        ErrorKind::Cancelled
    );
    // cleanup ran to completion despite the cancel
    assert!(!outcome.cleanup.timed_out);
    assert_eq!(outcome.cleanup.steps.len(), 1);
    assert!(outcome.cleanup.steps[0].result.ok);
    // no failure occurred, so on_failure did not run
    assert!(!outcome.cleanup.ran_on_failure);
}

#[tokio::test(start_paused = true)]
async fn cleanup_ceiling_preserves_the_verdict() {
    let suite = parse_suite(
        r#"
name: cleanup ceiling
tests:
  - name: quick
    steps:
      - name: ok
        plugin: http
        config: {}
cleanup:
  always:
    - name: stuck teardown
      plugin: stuck
      config:
        timeout: 2h
"#,
    )
    .expect("parse suite");

    let http = ScriptedPlugin::new("http", ScriptedCall::Output(json!({"status_code": 200, "body": {}})));
    let stuck = ScriptedPlugin::new(
        "stuck",
        ScriptedCall::SleepThen(Duration::from_secs(3600), json!({"done": true})),
    );
    let sink = CollectingSink::new();
    let host = host_with_plugins("run-ceiling", vec![http, stuck], sink);

    let started = tokio::time::Instant::now();
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-ceiling"),
        &WorkflowConfig::default(),
    )
    .await;

    // the ceiling fired at 45 minutes, well before the stuck plugin's hour
    assert!(started.elapsed() >= Duration::from_secs(45 * 60));
    assert!(started.elapsed() < Duration::from_secs(60 * 60));
    assert!(outcome.cleanup.timed_out);
    assert!(outcome.cleanup.steps.is_empty());
    // the verdict still reflects the tests, not the cleanup
    assert_eq!(outcome.status, RunStatus::Passed);
}

#[tokio::test]
async fn init_failure_skips_tests_and_runs_on_failure_cleanup() {
    let suite = parse_suite(
        r#"
name: init failure
init:
  - name: seed
    plugin: http
    config: {}
    assertions:
      - type: status_code
        expected: 200
tests:
  - name: never runs
    steps:
      - name: unreachable
        plugin: http
        config: {}
cleanup:
  on_failure:
    - name: report failure
      plugin: http
      config: {}
  always:
    - name: teardown
      plugin: http
      config: {}
"#,
    )
    .expect("parse suite");

    let stub = ScriptedPlugin::new("http", ScriptedCall::Output(json!({"status_code": 200, "body": {}})));
    stub.enqueue(ScriptedCall::Output(json!({"status_code": 500, "body": {}})));

    let sink = CollectingSink::new();
    let host = host_with_plugins("run-init-fail", vec![stub.clone()], sink);
    let outcome = run_suite(
        host,
        &suite,
        base_context("run-init-fail"),
        &WorkflowConfig::default(),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.tests[0].skipped);
    assert!(outcome.cleanup.ran_on_failure);
    // init call + on_failure + always; the skipped test never dispatched
    assert_eq!(stub.call_count(), 3);
    assert_eq!(outcome.cleanup.steps.len(), 2);
    assert_eq!(outcome.cleanup.steps[0].name, "report failure");
    assert_eq!(outcome.cleanup.steps[1].name, "teardown");
}
