//! In-memory run registry with per-run log fan-out.
//!
//! Each active run owns a bounded ring of retained lines (served to late
//! subscribers) and a list of live subscribers with bounded channels.
//! Appending never blocks: a subscriber that cannot keep up has lines
//! dropped and receives a single overrun marker once it drains.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rocketship_types::{LogColor, LogLine, RunStatus, RunSummary};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Message a subscriber receives once when it lagged behind.
pub const OVERRUN_MARKER: &str = "[overrun] subscriber lagged; older lines were dropped";
/// Message served to subscribers that attach after the run finished.
pub const RUN_COMPLETE_MARKER: &str = "[closed] run already complete; replaying retained lines";

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<LogLine>,
    overrun: bool,
}

struct RunEntry {
    summary: RunSummary,
    retained: VecDeque<LogLine>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Registry of active and recently finished runs.
pub struct RunRegistry {
    runs: DashMap<String, RunEntry>,
    /// Retained lines per run.
    buffer_lines: usize,
    /// Channel capacity per subscriber.
    subscriber_capacity: usize,
}

impl RunRegistry {
    pub fn new(buffer_lines: usize) -> Self {
        Self {
            runs: DashMap::new(),
            buffer_lines: buffer_lines.max(1),
            subscriber_capacity: buffer_lines.max(1),
        }
    }

    /// Register a new run in `PENDING` state.
    pub fn create(&self, run_id: &str, suite_name: &str, started_at: DateTime<Utc>) {
        self.runs.insert(
            run_id.to_string(),
            RunEntry {
                summary: RunSummary {
                    run_id: run_id.to_string(),
                    suite_name: suite_name.to_string(),
                    status: RunStatus::Pending,
                    started_at,
                    ended_at: None,
                },
                retained: VecDeque::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            },
        );
    }

    /// Transition a run's status. Terminal transitions close every
    /// subscription: senders are dropped, receivers drain and end.
    pub fn set_status(&self, run_id: &str, status: RunStatus, ended_at: Option<DateTime<Utc>>) {
        if let Some(mut entry) = self.runs.get_mut(run_id) {
            if entry.summary.status.is_terminal() {
                return;
            }
            entry.summary.status = status;
            if status.is_terminal() {
                entry.summary.ended_at = ended_at.or_else(|| Some(Utc::now()));
                entry.subscribers.clear();
            }
        }
    }

    /// Append one line: retain it, then fan out to every live subscriber
    /// without blocking.
    pub fn append(&self, run_id: &str, line: LogLine) {
        let Some(mut entry) = self.runs.get_mut(run_id) else {
            return;
        };

        if entry.retained.len() >= self.buffer_lines {
            entry.retained.pop_front();
        }
        entry.retained.push_back(line.clone());

        let mut disconnected = Vec::new();
        for subscriber in entry.subscribers.iter_mut() {
            if subscriber.overrun {
                // Try to surface the marker first; until it fits, keep
                // dropping lines for this subscriber.
                match subscriber.sender.try_send(overrun_marker()) {
                    Ok(()) => subscriber.overrun = false,
                    Err(mpsc::error::TrySendError::Full(_)) => continue,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        disconnected.push(subscriber.id);
                        continue;
                    }
                }
            }
            match subscriber.sender.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => subscriber.overrun = true,
                Err(mpsc::error::TrySendError::Closed(_)) => disconnected.push(subscriber.id),
            }
        }
        entry
            .subscribers
            .retain(|subscriber| !disconnected.contains(&subscriber.id));
    }

    /// Subscribe to a run's log stream.
    ///
    /// The retained window is replayed first. For a finished run the stream
    /// carries the window plus a completion marker and then ends; for a live
    /// run the subscriber keeps receiving new lines until the run reaches a
    /// terminal state and the buffer drains.
    pub fn subscribe(&self, run_id: &str) -> Option<mpsc::Receiver<LogLine>> {
        let mut entry = self.runs.get_mut(run_id)?;
        let capacity = self.subscriber_capacity + entry.retained.len() + 1;
        let (sender, receiver) = mpsc::channel(capacity);

        for line in &entry.retained {
            // Capacity covers the whole retained window.
            let _ = sender.try_send(line.clone());
        }

        if entry.summary.status.is_terminal() {
            let _ = sender.try_send(LogLine::info(Utc::now(), RUN_COMPLETE_MARKER).colored(LogColor::Purple));
            // Sender drops here: the receiver drains the window then ends.
            return Some(receiver);
        }

        let id = entry.next_subscriber_id;
        entry.next_subscriber_id += 1;
        entry.subscribers.push(Subscriber {
            id,
            sender,
            overrun: false,
        });
        Some(receiver)
    }

    /// Snapshot of one run.
    pub fn get(&self, run_id: &str) -> Option<RunSummary> {
        self.runs.get(run_id).map(|entry| entry.summary.clone())
    }

    /// Snapshot of every known run, most recent first.
    pub fn list(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> = self
            .runs
            .iter()
            .map(|entry| entry.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }
}

fn overrun_marker() -> LogLine {
    LogLine::info(Utc::now(), OVERRUN_MARKER).colored(LogColor::Purple)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(msg: &str) -> LogLine {
        LogLine::info(Utc::now(), msg)
    }

    #[tokio::test]
    async fn subscribers_receive_lines_in_emission_order() {
        let registry = RunRegistry::new(16);
        registry.create("r1", "suite", Utc::now());
        registry.set_status("r1", RunStatus::Running, None);

        let mut receiver = registry.subscribe("r1").expect("subscribe");
        for index in 0..5 {
            registry.append("r1", line(&format!("line {index}")));
        }
        registry.set_status("r1", RunStatus::Passed, None);

        let mut received = Vec::new();
        while let Some(log_line) = receiver.recv().await {
            received.push(log_line.msg);
        }
        assert_eq!(
            received,
            (0..5).map(|index| format!("line {index}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn slow_subscribers_get_an_overrun_marker_not_a_stall() {
        // Tiny buffers so the subscriber overruns quickly.
        let registry = RunRegistry::new(2);
        registry.create("r1", "suite", Utc::now());
        registry.set_status("r1", RunStatus::Running, None);

        let mut receiver = registry.subscribe("r1").expect("subscribe");
        // More lines than the subscriber channel can hold, without draining.
        for index in 0..10 {
            registry.append("r1", line(&format!("line {index}")));
        }
        // Drain; the producer side never blocked.
        let mut drained = Vec::new();
        while let Ok(log_line) = receiver.try_recv() {
            drained.push(log_line.msg);
        }
        assert!(!drained.is_empty());

        // The next append surfaces the overrun marker before new content.
        registry.append("r1", line("after overrun"));
        let marker = receiver.try_recv().expect("marker");
        assert_eq!(marker.msg, OVERRUN_MARKER);
        let next = receiver.try_recv().expect("line after marker");
        assert_eq!(next.msg, "after overrun");
    }

    #[tokio::test]
    async fn late_subscribers_get_the_retained_window_and_a_completion_marker() {
        let registry = RunRegistry::new(4);
        registry.create("r1", "suite", Utc::now());
        registry.set_status("r1", RunStatus::Running, None);
        for index in 0..6 {
            registry.append("r1", line(&format!("line {index}")));
        }
        registry.set_status("r1", RunStatus::Failed, None);

        let mut receiver = registry.subscribe("r1").expect("late subscribe");
        let mut received = Vec::new();
        while let Some(log_line) = receiver.recv().await {
            received.push(log_line.msg);
        }
        // Only the retained window survives (ring of 4), then the marker.
        assert_eq!(
            received,
            vec![
                "line 2".to_string(),
                "line 3".to_string(),
                "line 4".to_string(),
                "line 5".to_string(),
                RUN_COMPLETE_MARKER.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn terminal_transition_happens_once() {
        let registry = RunRegistry::new(4);
        registry.create("r1", "suite", Utc::now());
        registry.set_status("r1", RunStatus::Running, None);
        registry.set_status("r1", RunStatus::Failed, None);
        registry.set_status("r1", RunStatus::Passed, None);
        assert_eq!(registry.get("r1").expect("summary").status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn listing_orders_by_recency() {
        let registry = RunRegistry::new(4);
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        registry.create("old", "suite", earlier);
        registry.create("new", "suite", Utc::now());
        let listed = registry.list();
        assert_eq!(listed[0].run_id, "new");
        assert_eq!(listed[1].run_id, "old");
    }
}
