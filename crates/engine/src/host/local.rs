//! Live host: executes activities on the tokio pool, enforces timeouts and
//! cooperative cancellation, and records history as it goes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocketship_types::{EngineError, ErrorKind};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ActivityHandler, ActivityOptions, History, HistoryEvent, WorkflowHost};
use crate::plugin::ActivityContext;

const DEFAULT_ABANDON_GRACE: Duration = Duration::from_secs(30);

/// Host for one live run.
pub struct LocalHost {
    run_id: String,
    activities: HashMap<String, Arc<dyn ActivityHandler>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    history: Mutex<History>,
    abandon_grace: Duration,
}

impl LocalHost {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            run_id: run_id.into(),
            activities: HashMap::new(),
            cancel_tx,
            cancel_rx,
            history: Mutex::new(History::default()),
            abandon_grace: DEFAULT_ABANDON_GRACE,
        }
    }

    /// Register a named activity. Must happen before the workflow starts.
    pub fn register_activity(&mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) {
        self.activities.insert(name.into(), handler);
    }

    /// Override the post-cancellation grace window (tests).
    pub fn with_abandon_grace(mut self, grace: Duration) -> Self {
        self.abandon_grace = grace;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Snapshot of the history recorded so far.
    pub fn history(&self) -> History {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    fn record(&self, event: HistoryEvent) {
        if let Ok(mut history) = self.history.lock() {
            history.events.push(event);
        }
    }
}

#[async_trait]
impl WorkflowHost for LocalHost {
    async fn execute_activity(
        &self,
        name: &str,
        input: JsonValue,
        options: ActivityOptions,
    ) -> Result<JsonValue, EngineError> {
        let Some(handler) = self.activities.get(name) else {
            let error = EngineError::internal(format!("no activity registered under '{name}'"));
            self.record(HistoryEvent::Activity {
                key: options.key,
                name: name.to_string(),
                outcome: Err(error.clone()),
            });
            return Err(error);
        };

        // Detached invocations (cleanup) get a context that never cancels
        // and are shielded from the run's cancel signal.
        let ctx = if options.detached {
            ActivityContext::detached(self.run_id.clone())
        } else {
            ActivityContext::new(self.run_id.clone(), self.cancel_rx.clone())
        };
        let mut call = Box::pin(handler.call(ctx, input));
        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);
        let mut cancel_rx = self.cancel_rx.clone();

        let outcome = tokio::select! {
            outcome = &mut call => outcome,
            _ = &mut deadline => Err(EngineError::new(
                ErrorKind::StepTimeout,
                format!("activity '{name}' exceeded its {:?} timeout", options.timeout),
            )),
            changed = cancel_rx.changed(), if !options.detached => {
                if changed.is_err() {
                    // Sender dropped; treat as an internal shutdown.
                    Err(EngineError::internal("host cancellation channel closed"))
                } else {
                    // The activity already observed the cancel signal through
                    // its context; give it the grace window to wind down,
                    // then abandon it. Either way its result is discarded.
                    match tokio::time::timeout(self.abandon_grace, &mut call).await {
                        Ok(_) => Err(EngineError::new(ErrorKind::Cancelled, "activity cancelled")),
                        Err(_) => {
                            warn!(run_id = %self.run_id, activity = name, "activity abandoned after cancellation grace window");
                            Err(EngineError::new(
                                ErrorKind::Cancelled,
                                "activity abandoned after cancellation grace window",
                            ))
                        }
                    }
                }
            }
        };

        debug!(run_id = %self.run_id, activity = name, key = %options.key, ok = outcome.is_ok(), "activity completed");
        self.record(HistoryEvent::Activity {
            key: options.key,
            name: name.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn sleep(&self, key: &str, duration: Duration) {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                self.record(HistoryEvent::TimerFired { key: key.to_string() });
            }
            changed = cancel_rx.changed() => {
                // Cancellation interrupts pending timers so the workflow can
                // move to cleanup promptly. A cancel that predates this call
                // never fires `changed`, which lets cleanup-phase sleeps run
                // their full course.
                let _ = changed;
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let at = Utc::now();
        self.record(HistoryEvent::Now { at });
        at
    }

    fn new_random_id(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.record(HistoryEvent::RandomId { id: id.clone() });
        id
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowEcho;

    #[async_trait]
    impl ActivityHandler for SlowEcho {
        async fn call(
            &self,
            ctx: ActivityContext,
            input: JsonValue,
        ) -> Result<JsonValue, EngineError> {
            let millis = input["sleep_ms"].as_u64().unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(input),
                _ = ctx.cancelled() => Err(EngineError::new(ErrorKind::Cancelled, "cancelled")),
            }
        }
    }

    fn host() -> Arc<LocalHost> {
        let mut host = LocalHost::new("run-1");
        host.register_activity("echo", Arc::new(SlowEcho));
        Arc::new(host)
    }

    fn options(key: &str, timeout: Duration) -> ActivityOptions {
        ActivityOptions::new(key, timeout)
    }

    #[tokio::test]
    async fn activities_complete_and_are_recorded() {
        let host = host();
        let output = host
            .execute_activity("echo", json!({"sleep_ms": 0}), options("a", Duration::from_secs(1)))
            .await
            .expect("activity result");
        assert_eq!(output["sleep_ms"], 0);

        let history = host.history();
        assert!(matches!(
            &history.events[0],
            HistoryEvent::Activity { key, .. } if key == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_surface_as_step_timeout() {
        let host = host();
        let error = host
            .execute_activity(
                "echo",
                json!({"sleep_ms": 60_000}),
                options("slow", Duration::from_millis(50)),
            )
            .await
            .expect_err("timeout");
        assert_eq!(error.kind, ErrorKind::StepTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_inflight_activities() {
        let host = host();
        let runner = {
            let host = host.clone();
            tokio::spawn(async move {
                host.execute_activity(
                    "echo",
                    json!({"sleep_ms": 600_000}),
                    options("long", Duration::from_secs(3600)),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        host.cancel();
        let outcome = runner.await.expect("join");
        assert_eq!(outcome.expect_err("cancelled").kind, ErrorKind::Cancelled);
        assert!(host.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_record_only_when_they_elapse() {
        let host = host();
        host.sleep("short", Duration::from_millis(10)).await;
        assert!(host.history().timer_fired("short"));

        let sleeper = {
            let host = host.clone();
            tokio::spawn(async move { host.sleep("interrupted", Duration::from_secs(600)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        host.cancel();
        sleeper.await.expect("join");
        assert!(!host.history().timer_fired("interrupted"));
    }
}
