//! Replay host: serves a recorded history instead of executing anything.
//!
//! Activity outcomes are looked up by invocation key, timers resolve only if
//! they fired in the recorded run, and `now()` / `new_random_id()` replay
//! their recorded observations in order. Feeding workflow code the same
//! history therefore reproduces the same step sequence, saved variables, and
//! final status.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rocketship_types::EngineError;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{ActivityOptions, History, HistoryEvent, WorkflowHost};

pub struct ReplayHost {
    history: History,
    now_values: Mutex<VecDeque<DateTime<Utc>>>,
    random_ids: Mutex<VecDeque<String>>,
}

impl ReplayHost {
    pub fn new(history: History) -> Self {
        let now_values = history
            .events
            .iter()
            .filter_map(|event| match event {
                HistoryEvent::Now { at } => Some(*at),
                _ => None,
            })
            .collect();
        let random_ids = history
            .events
            .iter()
            .filter_map(|event| match event {
                HistoryEvent::RandomId { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        Self {
            history,
            now_values: Mutex::new(now_values),
            random_ids: Mutex::new(random_ids),
        }
    }
}

#[async_trait]
impl WorkflowHost for ReplayHost {
    async fn execute_activity(
        &self,
        name: &str,
        _input: JsonValue,
        options: ActivityOptions,
    ) -> Result<JsonValue, EngineError> {
        match self.history.activity_outcome(&options.key) {
            Some(outcome) => outcome.clone(),
            None => Err(EngineError::internal(format!(
                "history has no outcome for activity '{name}' with key '{}'; \
                 the workflow diverged from the recorded run",
                options.key
            ))),
        }
    }

    async fn sleep(&self, key: &str, _duration: Duration) {
        if self.history.timer_fired(key) {
            return;
        }
        // The timer never fired in the recorded run, so the racing branch
        // won; stay pending and let that branch win again.
        futures_util::future::pending::<()>().await;
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_values
            .lock()
            .ok()
            .and_then(|mut values| values.pop_front())
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }

    fn new_random_id(&self) -> String {
        self.random_ids
            .lock()
            .ok()
            .and_then(|mut ids| ids.pop_front())
            .unwrap_or_else(|| "replayed-id".to_string())
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}
