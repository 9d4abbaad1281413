//! Layered run context backing template resolution.
//!
//! The context is an ordered composition of immutable shared layers plus one
//! mutable per-test layer. Shared layers (built-ins, environment snapshot,
//! run environment, configuration vars, the frozen init scope) live behind
//! `Arc` so forking a context for a test is cheap, and writes in one test can
//! never leak into a sibling: isolation falls out of the data structure.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolution context for one run, viewed by one phase or test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    /// Run identifier, resolvable as `{{ .run.id }}`.
    run_id: String,
    /// Snapshot of the process environment captured at run start.
    ///
    /// Captured once so rendering stays a pure function of the context.
    system_env: Arc<HashMap<String, String>>,
    /// Run environment map: suite `env` defaults merged with CreateRun
    /// overrides.
    env: Arc<HashMap<String, String>>,
    /// Configuration variables (`{{ .vars.* }}`), a nested JSON object.
    vars: Arc<JsonValue>,
    /// Values saved by the init phase, frozen before any test starts.
    init_saved: Arc<HashMap<String, String>>,
    /// Per-test runtime layer; append-only via [`RunContext::save`].
    runtime: HashMap<String, String>,
}

impl RunContext {
    /// Build the base context for a run. `system_env` should be a snapshot of
    /// the worker process environment (tests inject their own).
    pub fn new(
        run_id: impl Into<String>,
        system_env: HashMap<String, String>,
        env: HashMap<String, String>,
        vars: JsonValue,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            system_env: Arc::new(system_env),
            env: Arc::new(env),
            vars: Arc::new(vars),
            init_saved: Arc::new(HashMap::new()),
            runtime: HashMap::new(),
        }
    }

    /// The run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Freeze `scope` as the shared init layer, clearing any runtime values.
    ///
    /// Called once when the init phase completes; every test fork created
    /// afterwards observes the frozen scope.
    pub fn with_init_scope(&self, scope: HashMap<String, String>) -> Self {
        let mut forked = self.clone();
        forked.init_saved = Arc::new(scope);
        forked.runtime = HashMap::new();
        forked
    }

    /// Fork a context for one test: shared layers are reused, the runtime
    /// layer starts empty.
    pub fn fork_for_test(&self) -> Self {
        let mut forked = self.clone();
        forked.runtime = HashMap::new();
        forked
    }

    /// Fork a context pre-seeded with runtime entries (cleanup summaries).
    pub fn fork_with_runtime(&self, runtime: HashMap<String, String>) -> Self {
        let mut forked = self.clone();
        forked.runtime = runtime;
        forked
    }

    /// Append one saved value to the runtime layer.
    pub fn save(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.runtime.insert(name.into(), value.into());
    }

    /// Append a batch of saved values to the runtime layer.
    pub fn save_all(&mut self, values: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in values {
            self.runtime.insert(name, value);
        }
    }

    /// The runtime layer of this view (saved values of the current test).
    pub fn runtime(&self) -> &HashMap<String, String> {
        &self.runtime
    }

    /// Environment lookup: process snapshot first, then the run env map.
    pub fn lookup_env(&self, name: &str) -> Option<&str> {
        self.system_env
            .get(name)
            .or_else(|| self.env.get(name))
            .map(String::as_str)
    }

    /// Saved-value lookup: the test's runtime layer first, then init scope.
    pub fn lookup_saved(&self, name: &str) -> Option<&str> {
        self.runtime
            .get(name)
            .or_else(|| self.init_saved.get(name))
            .map(String::as_str)
    }

    /// Dotted-path lookup into the configuration vars tree.
    pub fn lookup_var(&self, path: &str) -> Option<&JsonValue> {
        let mut current = self.vars.as_ref();
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Built-in lookup (`run.id`).
    pub fn lookup_builtin(&self, name: &str) -> Option<&str> {
        match name {
            "run.id" | "id" => Some(&self.run_id),
            _ => None,
        }
    }

    /// Bound environment names, sorted, for error messages.
    pub fn bound_env_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .system_env
            .keys()
            .chain(self.env.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Bound saved-value names (runtime plus init scope), sorted.
    pub fn bound_saved_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runtime
            .keys()
            .chain(self.init_saved.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Top-level configuration var names, sorted.
    pub fn bound_var_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vars
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Flattened state map handed to plugins: init scope overlaid by the
    /// runtime layer.
    pub fn state_snapshot(&self) -> HashMap<String, String> {
        let mut state: HashMap<String, String> = self.init_saved.as_ref().clone();
        state.extend(self.runtime.clone());
        state
    }

    /// The run env map handed to plugins.
    pub fn env_snapshot(&self) -> HashMap<String, String> {
        self.env.as_ref().clone()
    }
}
