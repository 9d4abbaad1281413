//! Run-time execution records: run lifecycle, step results, and streamed
//! log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::ErrorKind;

/// Lifecycle states of a run. Terminal states transition exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// True for `PASSED`, `FAILED`, and `CANCELLED`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Passed => "PASSED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        formatter.write_str(label)
    }
}

/// Compact run listing entry served by `ListRuns`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub suite_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Canonical record of one step execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// True when the plugin call, every assertion, and every required save
    /// succeeded.
    pub ok: bool,
    /// Plugin that produced this result.
    pub plugin: String,
    /// Opaque plugin output the assertions and saves were evaluated against.
    pub output: JsonValue,
    /// Values written into the runtime scope, already stringified.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub saved: BTreeMap<String, String>,
    /// Every assertion outcome in declaration order, including passes after
    /// the first failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_results: Vec<AssertionOutcome>,
    /// Wall-clock duration of the plugin call as observed by the activity.
    pub duration_ms: u64,
    /// Request evidence captured by the plugin, when it produces any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<JsonValue>,
    /// Response evidence captured by the plugin, when it produces any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<JsonValue>,
    /// The failure that marked this step failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// The classified failure carried inside a failed [`StepResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one assertion evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionOutcome {
    /// Assertion kind name, e.g. `status_code` or `json_path`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Path or selector the assertion navigated, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Rendered expected value in canonical string form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Actual value in canonical string form.
    pub actual: String,
    pub passed: bool,
    /// Human-readable explanation, present for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal colour applied to a streamed log line.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogColor {
    Green,
    Red,
    Purple,
    #[default]
    #[serde(rename = "")]
    None,
}

/// One structured log line streamed to run subscribers and persisted to the
/// log store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    /// Emission timestamp, RFC 3339.
    pub ts: DateTime<Utc>,
    pub msg: String,
    #[serde(default)]
    pub color: LogColor,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub step_name: String,
}

impl LogLine {
    /// Plain informational line with no colour.
    pub fn info(ts: DateTime<Utc>, msg: impl Into<String>) -> Self {
        Self {
            ts,
            msg: msg.into(),
            color: LogColor::None,
            bold: false,
            test_name: String::new(),
            step_name: String::new(),
        }
    }

    /// Attach the owning test and step labels.
    pub fn scoped(mut self, test_name: impl Into<String>, step_name: impl Into<String>) -> Self {
        self.test_name = test_name.into();
        self.step_name = step_name.into();
        self
    }

    /// Apply a colour.
    pub fn colored(mut self, color: LogColor) -> Self {
        self.color = color;
        self
    }

    /// Render the line bold.
    pub fn bolded(mut self) -> Self {
        self.bold = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Passed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn log_color_none_serializes_as_empty_string() {
        let line = LogLine::info(Utc::now(), "hello");
        let json = serde_json::to_value(&line).expect("serialize log line");
        assert_eq!(json["color"], "");
        assert_eq!(json["bold"], false);

        let green = serde_json::to_value(LogColor::Green).expect("serialize color");
        assert_eq!(green, "green");
    }

    #[test]
    fn step_result_round_trips_through_json() {
        let mut saved = BTreeMap::new();
        saved.insert("user_id".to_string(), "42".to_string());
        let result = StepResult {
            ok: true,
            plugin: "http".into(),
            output: serde_json::json!({"status_code": 200}),
            saved,
            assertion_results: vec![AssertionOutcome {
                kind: "status_code".into(),
                path: None,
                expected: Some("200".into()),
                actual: "200".into(),
                passed: true,
                message: None,
            }],
            duration_ms: 12,
            request_data: None,
            response_data: None,
            error: None,
        };
        let json = serde_json::to_string(&result).expect("serialize");
        let back: StepResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, result);
    }
}
