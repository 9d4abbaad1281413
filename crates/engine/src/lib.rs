//! # Rocketship Engine
//!
//! The execution core of the Rocketship integration-testing platform. It
//! parses and validates YAML suites, renders `{{ ... }}` templates over a
//! layered run context, dispatches steps to registered plugins, and drives
//! suites to a terminal verdict through a deterministic workflow built on a
//! durable-execution host SPI.
//!
//! ## Architecture
//!
//! - **`suite`**: YAML parsing, canonical serialization, and validation
//! - **`context` / `template`**: layered variable scopes and rendering
//! - **`plugin`**: the capability contract and the sealed registry
//! - **`activity`**: end-to-end execution of one step on a worker
//! - **`workflow`**: the deterministic suite state machine
//! - **`host`**: the substrate SPI with live and replay implementations

pub mod activity;
pub mod context;
pub mod host;
pub mod plugin;
pub mod suite;
pub mod template;
pub mod workflow;

pub use activity::{
    LogSink, NullObserver, NullSink, StepActivity, StepActivityHandler, StepActivityInput,
    StepObserver, StepScope,
};
pub use context::RunContext;
pub use host::{ActivityHandler, ActivityOptions, History, HistoryEvent, LocalHost, ReplayHost, WorkflowHost};
pub use plugin::{
    ActivityContext, DelayPlugin, HttpPlugin, Plugin, PluginOutcome, PluginParams, PluginRegistry,
    RegistryBuilder,
};
pub use suite::{parse_suite, serialize_suite, validate_suite};
pub use template::{render, render_value};
pub use workflow::{
    CleanupOutcome, RunOutcome, STEP_ACTIVITY, StepOutcome, TestOutcome, WorkflowConfig, run_suite,
};

use std::sync::Arc;

/// Wire a live host for one run: a [`LocalHost`] with the step activity
/// registered against the given registry, sink, and observer.
pub fn local_host_for_run(
    run_id: impl Into<String>,
    registry: Arc<PluginRegistry>,
    sink: Arc<dyn LogSink>,
    observer: Arc<dyn StepObserver>,
) -> LocalHost {
    let mut host = LocalHost::new(run_id);
    let activity = StepActivity::new(registry, sink, observer);
    host.register_activity(STEP_ACTIVITY, Arc::new(StepActivityHandler::new(activity)));
    host
}
