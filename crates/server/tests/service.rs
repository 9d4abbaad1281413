//! Service-level and HTTP-level integration tests for the engine server.

use async_trait::async_trait;
use rocketship_engine::{
    ActivityContext, Plugin, PluginOutcome, PluginParams, RegistryBuilder, WorkflowConfig,
};
use rocketship_server::{
    CreateRunRequest, EngineService, MemoryStore, PersistenceSink, RunRegistry, ServerConfig,
    spawn,
};
use rocketship_types::{EngineError, RunStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        _params: &PluginParams,
    ) -> Result<PluginOutcome, EngineError> {
        Ok(PluginOutcome::from(json!({
            "status_code": 200,
            "body": {"id": "42"},
        })))
    }
}

async fn wait_for_terminal(service: &Arc<EngineService>, run_id: &str) -> RunStatus {
    for _ in 0..200 {
        let summary = service.get_run(run_id).expect("run exists");
        if summary.status.is_terminal() {
            return summary.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run '{run_id}' did not reach a terminal state");
}

#[tokio::test]
async fn create_run_streams_ordered_logs_and_a_final_verdict() {
    let mut builder = RegistryBuilder::new();
    builder.register(Arc::new(EchoPlugin)).expect("register echo");
    let store = MemoryStore::new();
    let service = EngineService::new(
        builder.seal(),
        Arc::new(RunRegistry::new(256)),
        PersistenceSink::spawn(store.clone()),
        WorkflowConfig::default(),
    );

    let run_id = service
        .create_run(CreateRunRequest {
            suite_yaml: r#"
name: ordered
tests:
  - name: t
    steps:
      - name: first
        plugin: echo
        config: {}
        save:
          - type: json_path
            path: ".id"
            as: user_id
      - name: second
        plugin: echo
        config:
          url: "https://svc/{{ user_id }}"
"#
            .to_string(),
            ..CreateRunRequest::default()
        })
        .expect("create run");

    assert_eq!(wait_for_terminal(&service, &run_id).await, RunStatus::Passed);

    // late subscription replays the retained window in order
    let mut receiver = service.stream_logs(&run_id).expect("subscribe");
    let mut messages = Vec::new();
    while let Some(line) = receiver.recv().await {
        messages.push((line.msg.clone(), line.bold));
    }

    let position = |needle: &str| {
        messages
            .iter()
            .position(|(msg, _)| msg.contains(needle))
            .unwrap_or_else(|| panic!("missing log line: {needle}"))
    };
    // completion of step N precedes the start of step N+1
    assert!(position("step 'first' passed") < position("step 'second' started"));
    // the stream ends with a bold verdict line
    let verdict = messages
        .iter()
        .rev()
        .find(|(msg, _)| msg.contains("run PASSED"))
        .expect("verdict line");
    assert!(verdict.1, "verdict line should be bold");

    // step projections landed in the store, keyed by (run, test, step)
    tokio::time::sleep(Duration::from_millis(100)).await;
    let first = store.step(&run_id, 0, 0).expect("step 0 row");
    assert_eq!(first.status, "PASSED");
    assert_eq!(first.variables_data["user_id"], "42");
    assert!(store.step(&run_id, 0, 1).is_some());
}

#[tokio::test]
async fn validation_failures_are_synchronous_and_machine_readable() {
    let service = EngineService::new(
        RegistryBuilder::with_builtins().expect("builtins").seal(),
        Arc::new(RunRegistry::new(64)),
        PersistenceSink::spawn(MemoryStore::new()),
        WorkflowConfig::default(),
    );

    let error = service
        .create_run(CreateRunRequest {
            suite_yaml: "name: bad\ntests:\n  - name: t\n    steps:\n      - name: s\n        plugin: nope\n        config: {}\n".to_string(),
            ..CreateRunRequest::default()
        })
        .expect_err("validation failure");
    assert_eq!(error.code, rocketship_server::RpcCode::InvalidArgument);
    assert!(!error.issues.is_empty());

    let parse_error = service
        .create_run(CreateRunRequest {
            suite_yaml: "name: [unclosed".to_string(),
            ..CreateRunRequest::default()
        })
        .expect_err("parse failure");
    assert_eq!(parse_error.code, rocketship_server::RpcCode::InvalidArgument);
}

#[tokio::test]
async fn http_surface_round_trips_a_run() {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        run_dir: std::env::temp_dir().join(format!("rocketship-test-{}", std::process::id())),
        ..ServerConfig::default()
    };
    let handle = spawn(config, None).await.expect("spawn server");
    let base = format!("http://{}", handle.addr);
    let client = reqwest::Client::new();

    // health is public and prompt
    let health: serde_json::Value = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["status"], "ok");

    let created: serde_json::Value = client
        .post(format!("{base}/v1/runs"))
        .json(&json!({
            "suite_yaml": "name: http round trip\ntests:\n  - name: t\n    steps:\n      - name: pause\n        plugin: delay\n        config:\n          duration: 10ms\n",
        }))
        .send()
        .await
        .expect("create request")
        .json()
        .await
        .expect("create body");
    let run_id = created["run_id"].as_str().expect("run id").to_string();

    // poll until terminal
    let mut status = String::new();
    for _ in 0..200 {
        let summary: serde_json::Value = client
            .get(format!("{base}/v1/runs/{run_id}"))
            .send()
            .await
            .expect("get run")
            .json()
            .await
            .expect("summary body");
        status = summary["status"].as_str().unwrap_or_default().to_string();
        if status == "PASSED" || status == "FAILED" || status == "CANCELLED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "PASSED");

    // the log stream replays the run and ends
    let body = client
        .get(format!("{base}/v1/runs/{run_id}/logs"))
        .send()
        .await
        .expect("stream request")
        .text()
        .await
        .expect("stream body");
    let lines: Vec<&str> = body.lines().collect();
    assert!(lines.iter().any(|line| line.contains("run PASSED")));

    // unknown runs are NOT_FOUND with a machine-readable code
    let missing = client
        .get(format!("{base}/v1/runs/does-not-exist"))
        .send()
        .await
        .expect("missing run request");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let missing_body: serde_json::Value = missing.json().await.expect("missing body");
    assert_eq!(missing_body["code"], "NOT_FOUND");

    handle.shutdown().await.expect("shutdown");
}
