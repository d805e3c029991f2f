//! Provisioning event tracker.
//!
//! One progress record per instance while an operation runs, plus a bounded log buffer.
//! Records are purged a while after they reach a terminal status; that purge is the only
//! cleanup. State is process-local: it does not survive a restart and is not shared between
//! orchestrator replicas.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use botfleet_common::progress::{
    LogStream, ProgressStatus, ProvisioningLogEntry, ProvisioningProgress, StepDescriptor,
    StepStatus,
};

use crate::progress_events::ProgressSink;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub operation_timeout: Duration,
    pub success_retention: Duration,
    pub failure_retention: Duration,
    pub log_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(15 * 60),
            success_retention: Duration::from_secs(60),
            failure_retention: Duration::from_secs(5 * 60),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

pub fn timeout_message(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("Operation timed out after {} minutes", secs / 60)
    } else {
        format!("Operation timed out after {} seconds", secs)
    }
}

struct LogSubscriber {
    instance_id: Uuid,
    tx: mpsc::UnboundedSender<ProvisioningLogEntry>,
}

#[derive(Default)]
struct TrackerState {
    progress: HashMap<Uuid, ProvisioningProgress>,
    logs: HashMap<Uuid, VecDeque<ProvisioningLogEntry>>,
    // Timeout timer while in progress, purge timer once terminal.
    timers: HashMap<Uuid, JoinHandle<()>>,
    subscriber: Option<LogSubscriber>,
}

struct Shared {
    state: Mutex<TrackerState>,
    sink: Arc<dyn ProgressSink>,
    config: TrackerConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ProvisioningTracker {
    shared: Arc<Shared>,
}

fn now_step_done(progress: &mut ProvisioningProgress, idx: usize, status: StepStatus) {
    let step = &mut progress.steps[idx];
    step.status = status;
    step.completed_at = Some(Utc::now());
}

/// Next `pending` step after `idx`, or the first pending step anywhere.
fn next_pending(progress: &ProvisioningProgress, idx: usize) -> Option<String> {
    progress
        .steps
        .iter()
        .skip(idx + 1)
        .chain(progress.steps.iter().take(idx))
        .find(|s| s.status == StepStatus::Pending)
        .map(|s| s.id.clone())
}

impl ProvisioningTracker {
    pub fn new(sink: Arc<dyn ProgressSink>, config: TrackerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState::default()),
                sink,
                config,
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Begin tracking an operation. Replaces any previous record for the instance and clears
    /// its log buffer. Returns the operation id.
    pub fn start_operation(&self, instance_id: Uuid, steps: &[StepDescriptor]) -> Uuid {
        let progress = ProvisioningProgress::new(instance_id, steps);
        let operation_id = progress.operation_id;
        let snapshot = {
            let mut st = self.shared.lock();
            if let Some(prev) = st.progress.get(&instance_id) {
                if prev.status == ProgressStatus::InProgress {
                    tracing::warn!(
                        instance_id = %instance_id,
                        previous_operation = %prev.operation_id,
                        "[progress] replacing an operation that is still in progress"
                    );
                }
            }
            if let Some(t) = st.timers.remove(&instance_id) {
                t.abort();
            }
            st.logs.remove(&instance_id);
            st.progress.insert(instance_id, progress.clone());
            let timer = self.spawn_timeout(instance_id, operation_id);
            st.timers.insert(instance_id, timer);
            progress
        };
        self.shared.sink.emit_progress(&snapshot);
        operation_id
    }

    fn spawn_timeout(&self, instance_id: Uuid, operation_id: Uuid) -> JoinHandle<()> {
        let tracker = self.clone();
        let timeout = self.shared.config.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracker.on_timeout(instance_id, operation_id);
        })
    }

    fn spawn_purge(&self, instance_id: Uuid, operation_id: Uuid, after: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracker.purge(instance_id, operation_id);
        })
    }

    fn on_timeout(&self, instance_id: Uuid, operation_id: Uuid) {
        self.expire(instance_id, Some(operation_id), false);
    }

    /// Move the in-progress operation to `timeout` now, as if its timer had fired.
    /// Used when the caller's own deadline on the operation expires first.
    pub fn time_out(&self, instance_id: Uuid) -> bool {
        self.expire(instance_id, None, true)
    }

    fn expire(&self, instance_id: Uuid, operation_id: Option<Uuid>, abort_timer: bool) -> bool {
        let message = timeout_message(self.shared.config.operation_timeout);
        let snapshot = {
            let mut st = self.shared.lock();
            let Some(p) = st.progress.get_mut(&instance_id) else {
                return false;
            };
            if operation_id.map_or(false, |op| op != p.operation_id)
                || p.status != ProgressStatus::InProgress
            {
                return false;
            }
            let now = Utc::now();
            for step in p.steps.iter_mut().filter(|s| s.status == StepStatus::InProgress) {
                step.status = StepStatus::Error;
                step.error = Some(message.clone());
                step.completed_at = Some(now);
            }
            p.status = ProgressStatus::Timeout;
            p.error = Some(message.clone());
            p.completed_at = Some(now);
            let snapshot = p.clone();
            let purge = self.spawn_purge(instance_id, snapshot.operation_id, self.shared.config.failure_retention);
            // From the timer task itself the old handle is that task; only replace it.
            if let Some(old) = st.timers.insert(instance_id, purge) {
                if abort_timer {
                    old.abort();
                }
            }
            snapshot
        };
        tracing::warn!(
            instance_id = %instance_id,
            operation_id = %snapshot.operation_id,
            "[progress] {}",
            message
        );
        self.shared.sink.emit_progress(&snapshot);
        true
    }

    fn purge(&self, instance_id: Uuid, operation_id: Uuid) {
        let mut st = self.shared.lock();
        let matches = st
            .progress
            .get(&instance_id)
            .map_or(false, |p| p.operation_id == operation_id && p.status.is_terminal());
        if matches {
            st.progress.remove(&instance_id);
            st.logs.remove(&instance_id);
            st.timers.remove(&instance_id);
            tracing::debug!(instance_id = %instance_id, "[progress] purged operation record");
        }
    }

    /// Apply `f` to the in-progress record, then emit the result. No-op once terminal.
    fn mutate<F>(&self, instance_id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut ProvisioningProgress) -> bool,
    {
        let snapshot = {
            let mut st = self.shared.lock();
            let Some(p) = st.progress.get_mut(&instance_id) else {
                return false;
            };
            if p.status.is_terminal() {
                return false;
            }
            if !f(p) {
                return false;
            }
            p.clone()
        };
        self.shared.sink.emit_progress(&snapshot);
        true
    }

    pub fn update_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        status: StepStatus,
        message: Option<String>,
        error: Option<String>,
    ) -> bool {
        self.mutate(instance_id, |p| {
            let Some(idx) = p.steps.iter().position(|s| s.id == step_id) else {
                tracing::warn!(instance_id = %instance_id, step_id, "[progress] unknown step");
                return false;
            };
            match status {
                StepStatus::InProgress => {
                    // Keep at most one step running.
                    for other in 0..p.steps.len() {
                        if other != idx && p.steps[other].status == StepStatus::InProgress {
                            now_step_done(p, other, StepStatus::Completed);
                        }
                    }
                    let step = &mut p.steps[idx];
                    step.status = StepStatus::InProgress;
                    step.started_at.get_or_insert_with(Utc::now);
                    step.completed_at = None;
                    p.current_step = Some(step_id.to_string());
                }
                StepStatus::Completed | StepStatus::Skipped => {
                    now_step_done(p, idx, status);
                    if let Some(next) = next_pending(p, idx) {
                        p.current_step = Some(next);
                    }
                }
                StepStatus::Error => {
                    now_step_done(p, idx, status);
                    p.current_step = Some(step_id.to_string());
                }
                StepStatus::Pending => {
                    let step = &mut p.steps[idx];
                    step.status = StepStatus::Pending;
                    step.started_at = None;
                    step.completed_at = None;
                }
            }
            let step = &mut p.steps[idx];
            if message.is_some() {
                step.message = message;
            }
            if error.is_some() {
                step.error = error;
            }
            true
        })
    }

    pub fn start_step(&self, instance_id: Uuid, step_id: &str, message: Option<String>) -> bool {
        self.update_step(instance_id, step_id, StepStatus::InProgress, message, None)
    }

    pub fn complete_step(&self, instance_id: Uuid, step_id: &str, message: Option<String>) -> bool {
        self.update_step(instance_id, step_id, StepStatus::Completed, message, None)
    }

    /// Mark the running step (or, failing that, the current step) as `error`.
    pub fn fail_current_step(&self, instance_id: Uuid, error: &str) -> bool {
        self.mutate(instance_id, |p| {
            let idx = p
                .steps
                .iter()
                .position(|s| s.status == StepStatus::InProgress)
                .or_else(|| {
                    let current = p.current_step.as_deref()?;
                    p.steps.iter().position(|s| s.id == current)
                });
            let Some(idx) = idx else {
                return false;
            };
            now_step_done(p, idx, StepStatus::Error);
            p.steps[idx].error = Some(error.to_string());
            p.current_step = Some(p.steps[idx].id.clone());
            true
        })
    }

    fn finish(&self, instance_id: Uuid, status: ProgressStatus, error: Option<String>) -> bool {
        let retention = if status == ProgressStatus::Completed {
            self.shared.config.success_retention
        } else {
            self.shared.config.failure_retention
        };
        let snapshot = {
            let mut st = self.shared.lock();
            let Some(p) = st.progress.get_mut(&instance_id) else {
                return false;
            };
            if p.status.is_terminal() {
                return false;
            }
            let now = Utc::now();
            for step in p.steps.iter_mut() {
                match (step.status, status) {
                    (StepStatus::Pending, _) => step.status = StepStatus::Skipped,
                    (StepStatus::InProgress, ProgressStatus::Completed) => {
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(now);
                    }
                    (StepStatus::InProgress, _) => {
                        step.status = StepStatus::Error;
                        step.error = error.clone();
                        step.completed_at = Some(now);
                    }
                    _ => {}
                }
            }
            p.status = status;
            p.error = error;
            p.completed_at = Some(now);
            let snapshot = p.clone();
            if let Some(t) = st.timers.remove(&instance_id) {
                t.abort();
            }
            let purge = self.spawn_purge(instance_id, snapshot.operation_id, retention);
            st.timers.insert(instance_id, purge);
            snapshot
        };
        self.shared.sink.emit_progress(&snapshot);
        true
    }

    /// Leftover `pending` steps become `skipped`; purged after the success retention window.
    pub fn complete_operation(&self, instance_id: Uuid) -> bool {
        self.finish(instance_id, ProgressStatus::Completed, None)
    }

    pub fn fail_operation(&self, instance_id: Uuid, error: &str) -> bool {
        self.finish(instance_id, ProgressStatus::Error, Some(error.to_string()))
    }

    /// Buffer a log line and push it to the live subscriber and the sink.
    /// `step_id` defaults to the step currently running.
    pub fn append_log(&self, instance_id: Uuid, step_id: Option<&str>, stream: LogStream, line: &str) {
        let entry = {
            let mut st = self.shared.lock();
            let step_id = step_id.map(str::to_string).or_else(|| {
                st.progress
                    .get(&instance_id)
                    .and_then(|p| p.in_progress_step().map(|s| s.id.clone()))
            });
            let entry = ProvisioningLogEntry {
                instance_id,
                step_id,
                stream,
                line: line.to_string(),
                timestamp: Utc::now(),
            };
            let capacity = self.shared.config.log_capacity.max(1);
            let buf = st.logs.entry(instance_id).or_default();
            buf.push_back(entry.clone());
            while buf.len() > capacity {
                buf.pop_front();
            }
            let delivered = match &st.subscriber {
                Some(sub) if sub.instance_id == instance_id => sub.tx.send(entry.clone()).is_ok(),
                _ => true,
            };
            if !delivered {
                st.subscriber = None;
            }
            entry
        };
        self.shared.sink.emit_log(&entry);
    }

    /// Live log feed for one instance. Only one subscriber exists per tracker; subscribing
    /// again replaces (and closes) the previous feed. Use `get_recent_logs` for backlog.
    pub fn subscribe_logs(&self, instance_id: Uuid) -> mpsc::UnboundedReceiver<ProvisioningLogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().subscriber = Some(LogSubscriber { instance_id, tx });
        rx
    }

    pub fn get_progress(&self, instance_id: Uuid) -> Option<ProvisioningProgress> {
        self.shared.lock().progress.get(&instance_id).cloned()
    }

    pub fn get_recent_logs(&self, instance_id: Uuid) -> Vec<ProvisioningLogEntry> {
        self.shared
            .lock()
            .logs
            .get(&instance_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instances with an operation still in progress.
    pub fn active_operations(&self) -> Vec<ProvisioningProgress> {
        self.shared
            .lock()
            .progress
            .values()
            .filter(|p| p.status == ProgressStatus::InProgress)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress_events::NoopSink;

    fn steps() -> Vec<StepDescriptor> {
        vec![
            StepDescriptor::new("a", "A"),
            StepDescriptor::new("b", "B"),
            StepDescriptor::new("c", "C"),
        ]
    }

    fn tracker() -> ProvisioningTracker {
        ProvisioningTracker::new(Arc::new(NoopSink), TrackerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_step_in_progress() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        assert_eq!(t.get_progress(id).unwrap().current_step.as_deref(), Some("a"));

        t.start_step(id, "a", None);
        t.start_step(id, "b", Some("working".into()));
        let p = t.get_progress(id).unwrap();
        assert_eq!(p.in_progress_count(), 1);
        assert_eq!(p.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(p.current_step.as_deref(), Some("b"));
        assert_eq!(p.step("b").unwrap().message.as_deref(), Some("working"));
    }

    #[tokio::test(start_paused = true)]
    async fn completing_a_step_advances_current_step() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "a", None);
        t.complete_step(id, "a", None);
        let p = t.get_progress(id).unwrap();
        assert_eq!(p.current_step.as_deref(), Some("b"));
        assert_eq!(p.in_progress_count(), 0);
        assert!(!t.update_step(id, "zzz", StepStatus::Completed, None, None));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_skips_pending_and_purges_after_a_minute() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "a", None);
        t.complete_step(id, "a", None);
        assert!(t.complete_operation(id));

        let p = t.get_progress(id).unwrap();
        assert_eq!(p.status, ProgressStatus::Completed);
        assert_eq!(p.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(p.step("c").unwrap().status, StepStatus::Skipped);
        assert!(!t.complete_operation(id), "terminal records are frozen");

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(t.get_progress(id).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(t.get_progress(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_marks_running_step_and_retains_five_minutes() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "b", None);
        t.fail_current_step(id, "boom");
        t.fail_operation(id, "boom");

        let p = t.get_progress(id).unwrap();
        assert_eq!(p.status, ProgressStatus::Error);
        assert_eq!(p.step("b").unwrap().status, StepStatus::Error);
        assert_eq!(p.step("b").unwrap().error.as_deref(), Some("boom"));

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert!(t.get_progress(id).is_some());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(t.get_progress(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_operation_times_out_then_is_purged() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "a", None);

        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        let p = t.get_progress(id).unwrap();
        assert_eq!(p.status, ProgressStatus::Timeout);
        let a = p.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Error);
        assert_eq!(a.error.as_deref(), Some("Operation timed out after 15 minutes"));
        assert!(!t.complete_step(id, "a", None), "late updates are ignored");

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert!(t.get_progress(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_time_out_matches_the_timer_transition() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "a", None);

        assert!(t.time_out(id));
        assert!(!t.time_out(id), "already terminal");
        let p = t.get_progress(id).unwrap();
        assert_eq!(p.status, ProgressStatus::Timeout);
        assert_eq!(p.step("a").unwrap().status, StepStatus::Error);
        assert_eq!(p.step("b").unwrap().status, StepStatus::Pending);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert!(t.get_progress(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timers_leave_newer_operations_alone() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.fail_operation(id, "first");
        let second = t.start_operation(id, &steps());

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        let p = t.get_progress(id).unwrap();
        assert_eq!(p.operation_id, second);
        assert_eq!(p.status, ProgressStatus::InProgress);
    }

    #[tokio::test]
    async fn log_buffer_keeps_newest_500() {
        let t = tracker();
        let id = Uuid::new_v4();
        for i in 0..600 {
            t.append_log(id, None, LogStream::Stdout, &format!("line {}", i));
        }
        let logs = t.get_recent_logs(id);
        assert_eq!(logs.len(), 500);
        assert_eq!(logs.first().unwrap().line, "line 100");
        assert_eq!(logs.last().unwrap().line, "line 599");
    }

    #[tokio::test]
    async fn logs_default_to_running_step() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.start_operation(id, &steps());
        t.start_step(id, "b", None);
        t.append_log(id, None, LogStream::Stderr, "pulling");
        assert_eq!(t.get_recent_logs(id)[0].step_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn new_subscriber_replaces_previous() {
        let t = tracker();
        let id = Uuid::new_v4();
        let mut first = t.subscribe_logs(id);
        let mut second = t.subscribe_logs(id);
        t.append_log(id, None, LogStream::Stdout, "hello");

        assert_eq!(second.recv().await.unwrap().line, "hello");
        assert!(first.recv().await.is_none());

        let mut other = t.subscribe_logs(Uuid::new_v4());
        t.append_log(id, None, LogStream::Stdout, "not for you");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn timeout_message_formats_minutes() {
        assert_eq!(
            timeout_message(Duration::from_secs(900)),
            "Operation timed out after 15 minutes"
        );
        assert_eq!(timeout_message(Duration::from_secs(90)), "Operation timed out after 90 seconds");
    }
}
