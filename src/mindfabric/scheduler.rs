//! Task scheduling.
//!
//! Future commitments live here: one-shot tasks (`defer_until`) and
//! recurring cron tasks (`schedule_cron`). A background ticker (1 s by
//! default) checks the active map; a due task emits a
//! [`TriggeredThought`] carrying its trigger prompt into the channel the
//! reasoning layer consumes. One-shot tasks auto-remove on trigger; cron
//! tasks stay active and record their last firing.
//!
//! Tasks persist to the graph store at registration and on every status
//! change, and the scheduler rehydrates active tasks on start, so a
//! restart loses nothing that was committed.

use crate::mindfabric::config::SchedulerConfig;
use crate::mindfabric::error::{FabricError, FabricResult};
use crate::mindfabric::persistence::GraphStore;
use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

/// One self-deferral entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralRecord {
    pub deferred_at: DateTime<Utc>,
    pub deferred_to: DateTime<Utc>,
    pub reason: String,
}

/// A scheduled goal. Exactly one of `defer_until` / `schedule_cron` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub name: String,
    pub goal_description: String,
    pub status: TaskStatus,
    pub defer_until: Option<DateTime<Utc>>,
    pub schedule_cron: Option<String>,
    pub trigger_prompt: String,
    pub origin_thought_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub deferral_count: u32,
    pub deferral_history: Vec<DeferralRecord>,
}

/// The thought a triggered task injects into the reasoning layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredThought {
    pub thought_id: String,
    pub scheduled_task_id: String,
    pub origin_thought_id: Option<String>,
    pub trigger_prompt: String,
}

struct SchedulerShared {
    store: Arc<GraphStore>,
    active: Mutex<HashMap<String, ScheduledTask>>,
    thought_tx: mpsc::UnboundedSender<TriggeredThought>,
    last_tick: StdMutex<DateTime<Utc>>,
}

impl SchedulerShared {
    fn persist(&self, task: &ScheduledTask) {
        match serde_json::to_value(task) {
            Ok(payload) => {
                if let Err(e) =
                    self.store
                        .save_scheduled_task(&task.task_id, task.status.as_str(), &payload)
                {
                    error!("failed to persist task {}: {}", task.task_id, e);
                }
            }
            Err(e) => error!("failed to serialize task {}: {}", task.task_id, e),
        }
    }

    fn emit(&self, task: &ScheduledTask) {
        let thought = TriggeredThought {
            thought_id: Uuid::new_v4().to_string(),
            scheduled_task_id: task.task_id.clone(),
            origin_thought_id: task.origin_thought_id.clone(),
            trigger_prompt: task.trigger_prompt.clone(),
        };
        debug!("task {} triggered thought {}", task.task_id, thought.thought_id);
        if self.thought_tx.send(thought).is_err() {
            warn!("thought receiver dropped, task {} trigger lost", task.task_id);
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        let last = {
            let mut guard = self.last_tick.lock().expect("tick clock poisoned");
            std::mem::replace(&mut *guard, now)
        };

        let mut active = self.active.lock().await;
        let mut finished: Vec<String> = Vec::new();

        for task in active.values_mut() {
            if task.status != TaskStatus::Active {
                continue;
            }

            if let Some(defer_until) = task.defer_until {
                if defer_until <= now {
                    self.emit(task);
                    task.status = TaskStatus::Complete;
                    task.last_triggered_at = Some(now);
                    self.persist(task);
                    finished.push(task.task_id.clone());
                }
                continue;
            }

            if let Some(ref expression) = task.schedule_cron {
                if cron_due(expression, last, now) {
                    self.emit(task);
                    task.last_triggered_at = Some(now);
                    self.persist(task);
                }
            }
        }

        for task_id in finished {
            active.remove(&task_id);
        }
    }
}

/// In-process scheduler for one-shot and recurring future tasks.
pub struct TaskSchedulerService {
    shared: Arc<SchedulerShared>,
    tick_interval: StdDuration,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSchedulerService {
    /// Build the scheduler. The returned receiver yields the thoughts
    /// triggered tasks produce; the reasoning layer owns it.
    pub fn new(
        store: Arc<GraphStore>,
        config: &SchedulerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TriggeredThought>) {
        let (thought_tx, thought_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            shared: Arc::new(SchedulerShared {
                store,
                active: Mutex::new(HashMap::new()),
                thought_tx,
                last_tick: StdMutex::new(Utc::now()),
            }),
            tick_interval: StdDuration::from_secs_f64(config.tick_interval_s.max(0.01)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        };
        (scheduler, thought_rx)
    }

    /// Rehydrate persisted active tasks and launch the ticker.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.shared.store.load_scheduled_tasks(&["ACTIVE", "PENDING"]) {
            Ok(payloads) => {
                let mut active = self.shared.active.lock().await;
                for payload in payloads {
                    match serde_json::from_value::<ScheduledTask>(payload) {
                        Ok(task) => {
                            debug!("rehydrated task {}", task.task_id);
                            active.insert(task.task_id.clone(), task);
                        }
                        Err(e) => error!("failed to rehydrate scheduled task: {}", e),
                    }
                }
                info!("task scheduler rehydrated {} tasks", active.len());
            }
            Err(e) => error!("failed to load scheduled tasks: {}", e),
        }

        *self.shared.last_tick.lock().expect("tick clock poisoned") = Utc::now();
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let tick_interval = self.tick_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                shared.tick().await;
            }
        });
        *self.worker.lock().await = Some(handle);
        info!("task scheduler started");
    }

    /// Stop the ticker. Registered tasks stay persisted.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if tokio::time::timeout(StdDuration::from_secs(2), handle).await.is_err() {
                warn!("scheduler worker did not stop in time, abandoning");
            }
        }
        info!("task scheduler stopped");
    }

    /// Register a future task. Exactly one of `defer_until` and
    /// `schedule_cron` must be given; cron expressions are validated here.
    pub async fn schedule_task(
        &self,
        name: impl Into<String>,
        goal_description: impl Into<String>,
        trigger_prompt: impl Into<String>,
        origin_thought_id: Option<String>,
        defer_until: Option<DateTime<Utc>>,
        schedule_cron: Option<String>,
    ) -> FabricResult<ScheduledTask> {
        match (&defer_until, &schedule_cron) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(FabricError::Validation(
                    "exactly one of defer_until and schedule_cron must be set".to_string(),
                ));
            }
            _ => {}
        }
        if let Some(ref expression) = schedule_cron {
            Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
                FabricError::Validation(format!("invalid cron expression '{}': {}", expression, e))
            })?;
        }

        let task = ScheduledTask {
            task_id: format!("task_{}", Uuid::new_v4().simple()),
            name: name.into(),
            goal_description: goal_description.into(),
            status: TaskStatus::Active,
            defer_until,
            schedule_cron,
            trigger_prompt: trigger_prompt.into(),
            origin_thought_id,
            created_at: Utc::now(),
            last_triggered_at: None,
            deferral_count: 0,
            deferral_history: Vec::new(),
        };

        self.shared.persist(&task);
        self.shared
            .active
            .lock()
            .await
            .insert(task.task_id.clone(), task.clone());
        info!("scheduled task {} ({})", task.task_id, task.name);
        Ok(task)
    }

    /// Push a one-shot task further into the future, recording the
    /// self-deferral.
    pub async fn defer_task(
        &self,
        task_id: &str,
        new_time: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> FabricResult<()> {
        let mut active = self.shared.active.lock().await;
        let task = active.get_mut(task_id).ok_or_else(|| {
            FabricError::Validation(format!("no active task with id {}", task_id))
        })?;
        if task.schedule_cron.is_some() {
            return Err(FabricError::Validation(
                "recurring tasks cannot be deferred".to_string(),
            ));
        }

        task.deferral_history.push(DeferralRecord {
            deferred_at: Utc::now(),
            deferred_to: new_time,
            reason: reason.into(),
        });
        task.deferral_count += 1;
        task.defer_until = Some(new_time);
        self.shared.persist(task);
        Ok(())
    }

    /// Cancel a task: removed from the active map, marked failed in
    /// storage.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let mut active = self.shared.active.lock().await;
        if let Some(mut task) = active.remove(task_id) {
            task.status = TaskStatus::Failed;
            self.shared.persist(&task);
            true
        } else {
            false
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.shared.active.lock().await.get(task_id).cloned()
    }

    pub async fn active_tasks(&self) -> Vec<ScheduledTask> {
        self.shared.active.lock().await.values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Accept both classic five-field cron and the six/seven-field form with
/// seconds; five-field expressions get a zero seconds column.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Whether a cron expression has an occurrence in `(last, now]`.
fn cron_due(expression: &str, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match Schedule::from_str(&normalize_cron(expression)) {
        Ok(schedule) => schedule
            .after(&last)
            .next()
            .map(|next| next <= now)
            .unwrap_or(false),
        Err(e) => {
            error!("invalid cron expression '{}': {}", expression, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn five_field_cron_gains_seconds_column() {
        assert_eq!(normalize_cron("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron("0 * * * * *"), "0 * * * * *");
    }

    #[test]
    fn cron_due_detects_minute_boundary_crossings() {
        let now = Utc::now();
        // Every-minute schedule: due whenever the window crosses a minute.
        assert!(cron_due("* * * * *", now - Duration::seconds(61), now));
        // A window that is strictly inside one second cannot be due for a
        // yearly schedule.
        assert!(!cron_due("0 0 1 1 *", now - Duration::milliseconds(10), now));
    }

    #[tokio::test]
    async fn schedule_task_enforces_one_of_defer_and_cron() {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        let (scheduler, _rx) = TaskSchedulerService::new(store, &SchedulerConfig::default());

        let both = scheduler
            .schedule_task(
                "t",
                "goal",
                "prompt",
                None,
                Some(Utc::now()),
                Some("* * * * *".to_string()),
            )
            .await;
        assert!(both.is_err());

        let neither = scheduler
            .schedule_task("t", "goal", "prompt", None, None, None)
            .await;
        assert!(neither.is_err());

        let bad_cron = scheduler
            .schedule_task("t", "goal", "prompt", None, None, Some("not cron".to_string()))
            .await;
        assert!(bad_cron.is_err());
    }

    #[tokio::test]
    async fn deferral_updates_history_and_count() {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        let (scheduler, _rx) = TaskSchedulerService::new(store, &SchedulerConfig::default());

        let task = scheduler
            .schedule_task(
                "t",
                "goal",
                "prompt",
                Some("thought-0".to_string()),
                Some(Utc::now() + Duration::hours(1)),
                None,
            )
            .await
            .unwrap();

        let later = Utc::now() + Duration::hours(2);
        scheduler.defer_task(&task.task_id, later, "not ready").await.unwrap();

        let deferred = scheduler.get_task(&task.task_id).await.unwrap();
        assert_eq!(deferred.deferral_count, 1);
        assert_eq!(deferred.deferral_history.len(), 1);
        assert_eq!(deferred.defer_until, Some(later));
        assert_eq!(deferred.deferral_history[0].reason, "not ready");
    }
}
