//! Strongly typed suite schema shared across the parser, engine, and server.
//!
//! The models defined here mirror the YAML authoring surface. Authoring order
//! is preserved (via `IndexMap` and `Vec`) so execution, rendering, and
//! re-serialization all observe the sequence the author wrote.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A fully parsed test suite document.
///
/// Instances are produced by the suite parser, validated once, and treated as
/// immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    /// Human-readable suite name, required.
    pub name: String,
    /// Configuration variables referenced as `{{ .vars.path }}`.
    ///
    /// Values may be strings, numbers, booleans, or nested mappings; dotted
    /// template lookups traverse the nesting.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub vars: IndexMap<String, JsonValue>,
    /// Environment defaults referenced as `{{ .env.NAME }}`.
    ///
    /// Run-creation overrides are merged on top of these entries.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// Steps executed once before any test, in declaration order.
    ///
    /// Values they save become visible to every test and to cleanup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Step>,
    /// Independent tests; at least one is required.
    pub tests: Vec<TestSpec>,
    /// Cleanup hook sequences executed after the tests phase.
    #[serde(default, skip_serializing_if = "Cleanup::is_empty")]
    pub cleanup: Cleanup,
    /// Suite-level response validation defaults applied by HTTP steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openapi: Option<JsonValue>,
}

impl Suite {
    /// Iterate every step of the suite (init, tests, cleanup) with a
    /// human-readable location path for diagnostics.
    pub fn all_steps(&self) -> impl Iterator<Item = (String, &Step)> {
        let init = self
            .init
            .iter()
            .enumerate()
            .map(|(index, step)| (format!("init[{index}]"), step));
        let tests = self.tests.iter().enumerate().flat_map(|(test_index, test)| {
            test.steps
                .iter()
                .enumerate()
                .map(move |(step_index, step)| (format!("tests[{test_index}].steps[{step_index}]"), step))
        });
        let always = self
            .cleanup
            .always
            .iter()
            .enumerate()
            .map(|(index, step)| (format!("cleanup.always[{index}]"), step));
        let on_failure = self
            .cleanup
            .on_failure
            .iter()
            .enumerate()
            .map(|(index, step)| (format!("cleanup.on_failure[{index}]"), step));
        init.chain(tests).chain(always).chain(on_failure)
    }
}

/// A named, ordered sequence of steps that executes independently of other
/// tests in the same suite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Test name, unique enough to label log lines and persisted rows.
    pub name: String,
    /// Steps executed sequentially; step N+1 sees values saved by step N.
    pub steps: Vec<Step>,
}

/// One plugin invocation together with its assertions, saves, and retry
/// policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step name, non-empty and unique within its test.
    pub name: String,
    /// Registered plugin name selecting the capability to invoke.
    pub plugin: String,
    /// Free-form configuration handed to the plugin after template rendering.
    ///
    /// A `timeout: <duration>` entry overrides the default activity timeout.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub config: JsonValue,
    /// Assertions evaluated in order against the plugin output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,
    /// Values extracted from the plugin output into the runtime scope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub save: Vec<Save>,
    /// Optional per-step retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Cleanup hook sequences. Either list may be empty; `on_failure` runs only
/// when init or a test failed, `always` runs unconditionally afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Cleanup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Step>,
}

impl Cleanup {
    /// True when both hook sequences are empty.
    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.on_failure.is_empty()
    }
}

/// An assertion against a step's plugin output.
///
/// Known assertion kinds are evaluated by the step activity itself; any other
/// `type` value is carried through verbatim for the owning plugin to judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Assertion {
    Known(KnownAssertion),
    Plugin(PluginAssertion),
}

impl Assertion {
    /// The wire name of this assertion's `type` tag.
    pub fn kind_name(&self) -> &str {
        match self {
            Assertion::Known(known) => known.kind_name(),
            Assertion::Plugin(plugin) => plugin.kind.as_str(),
        }
    }
}

/// Assertion kinds the core evaluates directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownAssertion {
    /// Compare the `status_code` field of the output.
    StatusCode {
        /// Expected status; may be a number or a template string.
        expected: JsonValue,
    },
    /// Navigate the output body with a JSON path and compare or probe it.
    JsonPath {
        /// Path expression, e.g. `.items[0].id` or `$.users.length`.
        path: String,
        /// Expected value after canonical string coercion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<JsonValue>,
        /// When set, asserts presence (or absence) instead of equality.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exists: Option<bool>,
    },
    /// Compare a response header by name.
    Header {
        /// Header name, matched case-insensitively.
        name: String,
        expected: JsonValue,
    },
    /// Compare the number of rows returned by a SQL-shaped plugin.
    RowCount { expected: JsonValue },
    /// Compare a single column value in a SQL-shaped result set.
    ColumnValue {
        column: String,
        /// Row index, defaulting to the first row.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<usize>,
        expected: JsonValue,
    },
    /// Compare the `count` field of a Supabase-shaped response.
    SupabaseCount { expected: JsonValue },
}

impl KnownAssertion {
    /// The wire name of this assertion's `type` tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            KnownAssertion::StatusCode { .. } => "status_code",
            KnownAssertion::JsonPath { .. } => "json_path",
            KnownAssertion::Header { .. } => "header",
            KnownAssertion::RowCount { .. } => "row_count",
            KnownAssertion::ColumnValue { .. } => "column_value",
            KnownAssertion::SupabaseCount { .. } => "supabase_count",
        }
    }

    /// The expected value carried by this assertion, when it has one.
    pub fn expected(&self) -> Option<&JsonValue> {
        match self {
            KnownAssertion::StatusCode { expected }
            | KnownAssertion::Header { expected, .. }
            | KnownAssertion::RowCount { expected }
            | KnownAssertion::ColumnValue { expected, .. }
            | KnownAssertion::SupabaseCount { expected } => Some(expected),
            KnownAssertion::JsonPath { expected, .. } => expected.as_ref(),
        }
    }
}

/// A plugin-specific assertion the core forwards without interpreting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginAssertion {
    /// The `type` tag that did not match any core assertion kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining assertion fields, passed to the plugin verbatim.
    #[serde(flatten)]
    pub config: IndexMap<String, JsonValue>,
}

/// A value extraction rule, writing one entry into the runtime scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Save {
    /// Pull a value out of the output body with a JSON path.
    JsonPath {
        path: String,
        #[serde(rename = "as")]
        save_as: String,
        #[serde(default = "default_required")]
        required: bool,
    },
    /// Pull a response header by name.
    Header {
        name: String,
        #[serde(rename = "as")]
        save_as: String,
        #[serde(default = "default_required")]
        required: bool,
    },
    /// Pull a column value from a SQL-shaped result set.
    SqlResult {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<usize>,
        #[serde(rename = "as")]
        save_as: String,
        #[serde(default = "default_required")]
        required: bool,
    },
    /// Pull a field from a message-shaped plugin output.
    MessageField {
        field: String,
        #[serde(rename = "as")]
        save_as: String,
        #[serde(default = "default_required")]
        required: bool,
    },
    /// Pull topic metadata from a messaging plugin output.
    TopicInfo {
        field: String,
        #[serde(rename = "as")]
        save_as: String,
        #[serde(default = "default_required")]
        required: bool,
    },
}

fn default_required() -> bool {
    true
}

impl Save {
    /// The runtime variable name this rule writes.
    pub fn save_as(&self) -> &str {
        match self {
            Save::JsonPath { save_as, .. }
            | Save::Header { save_as, .. }
            | Save::SqlResult { save_as, .. }
            | Save::MessageField { save_as, .. }
            | Save::TopicInfo { save_as, .. } => save_as,
        }
    }

    /// Whether an unresolved value fails the step.
    pub fn is_required(&self) -> bool {
        match self {
            Save::JsonPath { required, .. }
            | Save::Header { required, .. }
            | Save::SqlResult { required, .. }
            | Save::MessageField { required, .. }
            | Save::TopicInfo { required, .. } => *required,
        }
    }
}

/// Per-step retry policy applied by the workflow between activity attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total invocation budget; 1 means no retries.
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,
    /// Delay before the first retry, as a duration string such as `100ms`.
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,
    /// Multiplier applied to the interval after each attempt; must be >= 1.0.
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    /// Error kind names that must not be retried even within budget.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_errors: Vec<String>,
}

fn default_maximum_attempts() -> u32 {
    1
}

fn default_initial_interval() -> String {
    "1s".to_string()
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: default_maximum_attempts(),
            initial_interval: default_initial_interval(),
            backoff_coefficient: default_backoff_coefficient(),
            non_retryable_errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_with_tagged_assertions_and_saves() {
        let yaml = r#"
name: create user
plugin: http
config:
  method: POST
  url: "https://api.example.com/users"
assertions:
  - type: status_code
    expected: 201
  - type: json_path
    path: ".id"
    exists: true
save:
  - type: json_path
    path: ".id"
    as: user_id
"#;
        let step: Step = serde_yaml::from_str(yaml).expect("parse step");
        assert_eq!(step.plugin, "http");
        assert_eq!(step.assertions.len(), 2);
        assert_eq!(step.assertions[0].kind_name(), "status_code");
        assert_eq!(step.save[0].save_as(), "user_id");
        assert!(step.save[0].is_required());
    }

    #[test]
    fn unknown_assertion_type_falls_through_to_plugin_variant() {
        let yaml = r#"
type: trace_span
span: checkout
expected: closed
"#;
        let assertion: Assertion = serde_yaml::from_str(yaml).expect("parse assertion");
        match assertion {
            Assertion::Plugin(plugin) => {
                assert_eq!(plugin.kind, "trace_span");
                assert_eq!(plugin.config["span"], "checkout");
            }
            Assertion::Known(_) => panic!("expected plugin passthrough variant"),
        }
    }

    #[test]
    fn retry_policy_defaults_apply() {
        let retry: RetryPolicy = serde_yaml::from_str("maximum_attempts: 3").expect("parse retry");
        assert_eq!(retry.maximum_attempts, 3);
        assert_eq!(retry.initial_interval, "1s");
        assert!(retry.non_retryable_errors.is_empty());
    }

    #[test]
    fn suite_rejects_unknown_top_level_keys() {
        let yaml = r#"
name: demo
tests:
  - name: t
    steps: []
extra_key: nope
"#;
        let parsed: Result<Suite, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }
}
