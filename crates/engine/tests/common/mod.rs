//! Shared fixtures for engine integration tests: a scriptable plugin double
//! and a collecting log sink.

use async_trait::async_trait;
use rocketship_engine::{
    ActivityContext, LogSink, NullObserver, Plugin, PluginOutcome, PluginParams, RegistryBuilder,
    RunContext,
};
use rocketship_types::{EngineError, ErrorKind, LogLine};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reaction of a [`ScriptedPlugin`].
#[derive(Clone)]
pub enum ScriptedCall {
    /// Return this output immediately.
    Output(JsonValue),
    /// Fail with the given kind and message.
    Fail(ErrorKind, String),
    /// Sleep (honouring cancellation) and then return this output.
    SleepThen(Duration, JsonValue),
}

/// A record of one invocation the plugin observed.
pub struct RecordedCall {
    pub config: JsonValue,
    pub at: tokio::time::Instant,
}

/// Plugin double driven by a queue of scripted reactions. When the queue is
/// exhausted the fallback reaction repeats.
pub struct ScriptedPlugin {
    name: String,
    script: Mutex<VecDeque<ScriptedCall>>,
    fallback: ScriptedCall,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedPlugin {
    pub fn new(name: impl Into<String>, fallback: ScriptedCall) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue(&self, call: ScriptedCall) {
        self.script.lock().expect("script lock").push_back(call);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn call_offsets_from_first(&self) -> Vec<Duration> {
        let calls = self.calls.lock().expect("calls lock");
        let Some(first) = calls.first() else {
            return Vec::new();
        };
        calls
            .iter()
            .map(|call| call.at.duration_since(first.at))
            .collect()
    }

    pub fn recorded_config(&self, index: usize) -> JsonValue {
        self.calls.lock().expect("calls lock")[index].config.clone()
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        params: &PluginParams,
    ) -> Result<PluginOutcome, EngineError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            config: params.config.clone(),
            at: tokio::time::Instant::now(),
        });

        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match next {
            ScriptedCall::Output(output) => Ok(PluginOutcome::from(output)),
            ScriptedCall::Fail(kind, message) => Err(EngineError::new(kind, message)),
            ScriptedCall::SleepThen(duration, output) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(PluginOutcome::from(output)),
                    _ = ctx.cancelled() => Err(EngineError::new(ErrorKind::Cancelled, "scripted sleep cancelled")),
                }
            }
        }
    }
}

/// Sink that records every line in arrival order.
#[derive(Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<LogLine>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().expect("lines lock").clone()
    }

    pub fn lines_for_test(&self, test_name: &str) -> Vec<LogLine> {
        self.lines()
            .into_iter()
            .filter(|line| line.test_name == test_name)
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn emit(&self, line: LogLine) {
        self.lines.lock().expect("lines lock").push(line);
    }
}

/// A live host wired with the given plugins and sink.
pub fn host_with_plugins(
    run_id: &str,
    plugins: Vec<Arc<dyn Plugin>>,
    sink: Arc<dyn LogSink>,
) -> Arc<rocketship_engine::LocalHost> {
    let mut builder = RegistryBuilder::new();
    for plugin in plugins {
        builder.register(plugin).expect("register plugin");
    }
    Arc::new(rocketship_engine::local_host_for_run(
        run_id,
        builder.seal(),
        sink,
        Arc::new(NullObserver),
    ))
}

/// A base run context with no environment and no vars.
pub fn base_context(run_id: &str) -> RunContext {
    RunContext::new(run_id, HashMap::new(), HashMap::new(), serde_json::json!({}))
}
