//! Write-behind persistence of run, test, and step projections.
//!
//! The workflow never waits on storage: projection records flow through an
//! unbounded channel into a writer task, and a failed write is logged and
//! dropped rather than surfaced into the run verdict. Step upserts are keyed
//! by `(run_id, test_index, step_index)` so retried deliveries stay
//! idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocketship_types::{LogLine, RunStatus, StepResult};
use rocketship_util::redact_value;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// Synthetic test indices for phases outside the tests sequence.
pub const INIT_TEST_INDEX: i32 = -1;
pub const CLEANUP_TEST_INDEX: i32 = -2;

/// Projection row for one run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub suite_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trigger: String,
    pub initiator: String,
}

/// Projection row for one test of a run.
#[derive(Debug, Clone)]
pub struct TestRecord {
    pub run_id: String,
    pub test_index: i32,
    pub name: String,
    pub status: String,
}

/// Projection row for one executed step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub run_id: String,
    pub test_index: i32,
    pub step_index: i32,
    pub plugin: String,
    pub name: String,
    pub status: String,
    pub duration_ms: i64,
    pub assertions_data: JsonValue,
    pub variables_data: JsonValue,
    pub step_config: JsonValue,
    pub request_data: Option<JsonValue>,
    pub response_data: Option<JsonValue>,
    pub error_message: Option<String>,
}

impl StepRecord {
    /// Build a projection from a step result, redacting the config.
    pub fn from_result(
        run_id: &str,
        test_index: i32,
        step_index: i32,
        step_name: &str,
        step_config: &JsonValue,
        result: &StepResult,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            test_index,
            step_index,
            plugin: result.plugin.clone(),
            name: step_name.to_string(),
            status: if result.ok { "PASSED" } else { "FAILED" }.to_string(),
            duration_ms: result.duration_ms as i64,
            assertions_data: serde_json::to_value(&result.assertion_results)
                .unwrap_or(JsonValue::Null),
            variables_data: serde_json::to_value(&result.saved).unwrap_or(JsonValue::Null),
            step_config: redact_value(step_config),
            request_data: result.request_data.clone(),
            response_data: result.response_data.clone(),
            error_message: result
                .error
                .as_ref()
                .map(|error| format!("{}: {}", error.kind, error.message)),
        }
    }
}

/// Storage backend for run projections and the append-only log store.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn record_run(&self, record: &RunRecord) -> anyhow::Result<()>;
    async fn record_test(&self, record: &TestRecord) -> anyhow::Result<()>;
    async fn record_step(&self, record: &StepRecord) -> anyhow::Result<()>;
    async fn record_log(&self, run_id: &str, line: &LogLine) -> anyhow::Result<()>;
}

/// One unit of write-behind work.
#[derive(Debug, Clone)]
pub enum ProjectionEvent {
    Run(RunRecord),
    Test(TestRecord),
    Step(StepRecord),
    Log { run_id: String, line: LogLine },
}

/// Cheap cloneable handle that enqueues projection events.
#[derive(Clone)]
pub struct PersistenceSink {
    sender: mpsc::UnboundedSender<ProjectionEvent>,
}

impl PersistenceSink {
    /// Spawn the writer task over the given store.
    pub fn spawn(store: Arc<dyn ResultStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ProjectionEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome = match &event {
                    ProjectionEvent::Run(record) => store.record_run(record).await,
                    ProjectionEvent::Test(record) => store.record_test(record).await,
                    ProjectionEvent::Step(record) => store.record_step(record).await,
                    ProjectionEvent::Log { run_id, line } => store.record_log(run_id, line).await,
                };
                if let Err(error) = outcome {
                    warn!(?error, "projection write failed; event dropped");
                }
            }
        });
        Self { sender }
    }

    pub fn record(&self, event: ProjectionEvent) {
        let _ = self.sender.send(event);
    }
}

/// In-memory store used in tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<String, RunRecord>>,
    tests: Mutex<HashMap<(String, i32), TestRecord>>,
    steps: Mutex<HashMap<(String, i32, i32), StepRecord>>,
    logs: Mutex<Vec<(String, LogLine)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.lock().ok()?.get(run_id).cloned()
    }

    pub fn step(&self, run_id: &str, test_index: i32, step_index: i32) -> Option<StepRecord> {
        self.steps
            .lock()
            .ok()?
            .get(&(run_id.to_string(), test_index, step_index))
            .cloned()
    }

    pub fn step_count(&self) -> usize {
        self.steps.lock().map(|steps| steps.len()).unwrap_or(0)
    }

    pub fn log_count(&self, run_id: &str) -> usize {
        self.logs
            .lock()
            .map(|logs| logs.iter().filter(|(id, _)| id == run_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn record_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(record.run_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn record_test(&self, record: &TestRecord) -> anyhow::Result<()> {
        if let Ok(mut tests) = self.tests.lock() {
            tests.insert((record.run_id.clone(), record.test_index), record.clone());
        }
        Ok(())
    }

    async fn record_step(&self, record: &StepRecord) -> anyhow::Result<()> {
        if let Ok(mut steps) = self.steps.lock() {
            steps.insert(
                (record.run_id.clone(), record.test_index, record.step_index),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn record_log(&self, run_id: &str, line: &LogLine) -> anyhow::Result<()> {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push((run_id.to_string(), line.clone()));
        }
        Ok(())
    }
}

/// Postgres-backed store. Schema is bootstrapped with embedded DDL; every
/// write is an idempotent upsert.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                suite_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ,
                trigger TEXT NOT NULL DEFAULT 'manual',
                initiator TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_tests (
                run_id TEXT NOT NULL,
                test_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (run_id, test_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_steps (
                run_id TEXT NOT NULL,
                test_index INTEGER NOT NULL,
                step_index INTEGER NOT NULL,
                plugin TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms BIGINT NOT NULL,
                assertions_data JSONB,
                variables_data JSONB,
                step_config JSONB,
                request_data JSONB,
                response_data JSONB,
                error_message TEXT,
                PRIMARY KEY (run_id, test_index, step_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_logs (
                id BIGSERIAL PRIMARY KEY,
                run_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                msg TEXT NOT NULL,
                color TEXT NOT NULL,
                bold BOOLEAN NOT NULL,
                test_name TEXT NOT NULL,
                step_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of persisted steps for one run, for diagnostics.
    pub async fn step_count(&self, run_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM run_steps WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn record_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, suite_name, status, started_at, ended_at, trigger, initiator)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO UPDATE
            SET status = EXCLUDED.status, ended_at = EXCLUDED.ended_at
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.suite_name)
        .bind(record.status.to_string())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(&record.trigger)
        .bind(&record.initiator)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_test(&self, record: &TestRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_tests (run_id, test_index, name, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id, test_index) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(&record.run_id)
        .bind(record.test_index)
        .bind(&record.name)
        .bind(&record.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_step(&self, record: &StepRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_steps (
                run_id, test_index, step_index, plugin, name, status, duration_ms,
                assertions_data, variables_data, step_config, request_data,
                response_data, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (run_id, test_index, step_index) DO UPDATE SET
                plugin = EXCLUDED.plugin,
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                duration_ms = EXCLUDED.duration_ms,
                assertions_data = EXCLUDED.assertions_data,
                variables_data = EXCLUDED.variables_data,
                step_config = EXCLUDED.step_config,
                request_data = EXCLUDED.request_data,
                response_data = EXCLUDED.response_data,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(&record.run_id)
        .bind(record.test_index)
        .bind(record.step_index)
        .bind(&record.plugin)
        .bind(&record.name)
        .bind(&record.status)
        .bind(record.duration_ms)
        .bind(&record.assertions_data)
        .bind(&record.variables_data)
        .bind(&record.step_config)
        .bind(&record.request_data)
        .bind(&record.response_data)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_log(&self, run_id: &str, line: &LogLine) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_logs (run_id, ts, msg, color, bold, test_name, step_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(line.ts)
        .bind(&line.msg)
        .bind(serde_json::to_string(&line.color).unwrap_or_default().trim_matches('"').to_string())
        .bind(line.bold)
        .bind(&line.test_name)
        .bind(&line.step_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
