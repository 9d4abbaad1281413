//! Durable-execution host SPI.
//!
//! Workflow code is deterministic: every non-deterministic operation (time,
//! random identifiers, I/O, timers) goes through this interface. The local
//! host executes activities on the tokio pool and records an append-only
//! history; the replay host serves that history back, reproducing the
//! original decisions without re-executing anything.

mod local;
mod replay;

pub use local::LocalHost;
pub use replay::ReplayHost;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocketship_types::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::plugin::ActivityContext;

/// Per-invocation options for an activity call.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Stable identity of this invocation inside the run history. The
    /// workflow derives it from phase, test index, step index, and attempt,
    /// which keeps replay independent of completion order under fan-out.
    pub key: String,
    /// Start-to-close timeout enforced at the activity boundary.
    pub timeout: Duration,
    /// Detach this invocation from run cancellation. Cleanup steps run
    /// detached: a cancelled run still gets its cleanup, bounded by the
    /// cleanup ceiling instead of the cancel signal.
    pub detached: bool,
}

impl ActivityOptions {
    pub fn new(key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            timeout,
            detached: false,
        }
    }

    /// Mark this invocation as detached from run cancellation.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

/// The substrate primitives available to workflow code.
#[async_trait]
pub trait WorkflowHost: Send + Sync {
    /// Invoke a registered activity and await its result.
    async fn execute_activity(
        &self,
        name: &str,
        input: JsonValue,
        options: ActivityOptions,
    ) -> Result<JsonValue, EngineError>;

    /// Durable timer. `key` identifies the timer in history; a timer that
    /// never fired in the original run stays pending on replay.
    async fn sleep(&self, key: &str, duration: Duration);

    /// Current time as observed by the workflow.
    fn now(&self) -> DateTime<Utc>;

    /// A fresh identifier, recorded so replay sees the same value.
    fn new_random_id(&self) -> String;

    /// True once cancellation has been requested for this run.
    fn is_cancelled(&self) -> bool;
}

/// A worker-side activity implementation the local host can dispatch to.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn call(&self, ctx: ActivityContext, input: JsonValue) -> Result<JsonValue, EngineError>;
}

/// Append-only record of everything non-deterministic one run observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct History {
    pub events: Vec<HistoryEvent>,
}

impl History {
    /// The recorded outcome of the activity invocation with this key.
    pub fn activity_outcome(&self, key: &str) -> Option<&Result<JsonValue, EngineError>> {
        self.events.iter().find_map(|event| match event {
            HistoryEvent::Activity { key: event_key, outcome, .. } if event_key == key => {
                Some(outcome)
            }
            _ => None,
        })
    }

    /// Whether the timer with this key fired during the recorded run.
    pub fn timer_fired(&self, key: &str) -> bool {
        self.events.iter().any(|event| {
            matches!(event, HistoryEvent::TimerFired { key: event_key } if event_key == key)
        })
    }
}

/// One recorded non-deterministic observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// An activity completed (successfully or not).
    Activity {
        key: String,
        name: String,
        outcome: Result<JsonValue, EngineError>,
    },
    /// A durable timer elapsed naturally.
    TimerFired { key: String },
    /// A `now()` observation.
    Now { at: DateTime<Utc> },
    /// A generated identifier.
    RandomId { id: String },
}
