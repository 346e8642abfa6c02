use chrono::{Duration, Utc};
use mindfabric::config::SchedulerConfig;
use mindfabric::persistence::GraphStore;
use mindfabric::scheduler::{TaskSchedulerService, TaskStatus};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_s: 0.05,
    }
}

#[tokio::test]
async fn one_shot_task_fires_once_and_leaves_the_active_map() {
    let store = Arc::new(GraphStore::open_in_memory().unwrap());
    let (scheduler, mut thoughts) = TaskSchedulerService::new(store, &fast_config());
    scheduler.start().await;

    let task = scheduler
        .schedule_task(
            "wake-up",
            "resume the deferred review",
            "run",
            Some("thought-origin".to_string()),
            Some(Utc::now() + Duration::milliseconds(100)),
            None,
        )
        .await
        .unwrap();

    let thought = tokio::time::timeout(StdDuration::from_millis(1500), thoughts.recv())
        .await
        .expect("thought should arrive within 1.5s")
        .expect("channel should stay open");

    assert_eq!(thought.scheduled_task_id, task.task_id);
    assert_eq!(thought.trigger_prompt, "run");
    assert_eq!(thought.origin_thought_id.as_deref(), Some("thought-origin"));

    // One-shot tasks auto-remove on trigger.
    assert!(scheduler.get_task(&task.task_id).await.is_none());

    // And they fire exactly once.
    let extra = tokio::time::timeout(StdDuration::from_millis(300), thoughts.recv()).await;
    assert!(extra.is_err());

    scheduler.stop().await;
}

#[tokio::test]
async fn cron_task_keeps_firing_and_stays_active() {
    let store = Arc::new(GraphStore::open_in_memory().unwrap());
    let (scheduler, mut thoughts) = TaskSchedulerService::new(store, &fast_config());
    scheduler.start().await;

    // Six-field cron with a seconds column: every second.
    let task = scheduler
        .schedule_task(
            "heartbeat",
            "emit a heartbeat thought",
            "beat",
            None,
            None,
            Some("* * * * * *".to_string()),
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(StdDuration::from_secs(3), thoughts.recv())
        .await
        .expect("first firing")
        .unwrap();
    let second = tokio::time::timeout(StdDuration::from_secs(3), thoughts.recv())
        .await
        .expect("second firing")
        .unwrap();
    assert_eq!(first.scheduled_task_id, task.task_id);
    assert_eq!(second.trigger_prompt, "beat");

    let live = scheduler.get_task(&task.task_id).await.expect("cron task stays active");
    assert_eq!(live.status, TaskStatus::Active);
    assert!(live.last_triggered_at.is_some());

    scheduler.stop().await;
}

#[tokio::test]
async fn active_tasks_rehydrate_from_storage_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");

    let task_id = {
        let store = Arc::new(GraphStore::open(&db_path).unwrap());
        let (scheduler, _thoughts) = TaskSchedulerService::new(store, &fast_config());
        let task = scheduler
            .schedule_task(
                "later",
                "pick this up after restart",
                "resume",
                None,
                Some(Utc::now() + Duration::hours(6)),
                None,
            )
            .await
            .unwrap();
        task.task_id
    };

    // A fresh scheduler over the same database picks the task back up.
    let store = Arc::new(GraphStore::open(&db_path).unwrap());
    let (scheduler, _thoughts) = TaskSchedulerService::new(store, &fast_config());
    scheduler.start().await;

    let restored = scheduler.get_task(&task_id).await.expect("task should rehydrate");
    assert_eq!(restored.status, TaskStatus::Active);
    assert_eq!(restored.trigger_prompt, "resume");

    scheduler.stop().await;
}

#[tokio::test]
async fn triggered_one_shots_do_not_rehydrate() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");

    {
        let store = Arc::new(GraphStore::open(&db_path).unwrap());
        let (scheduler, mut thoughts) = TaskSchedulerService::new(store, &fast_config());
        scheduler.start().await;
        scheduler
            .schedule_task(
                "now",
                "fire immediately",
                "go",
                None,
                Some(Utc::now() + Duration::milliseconds(50)),
                None,
            )
            .await
            .unwrap();
        tokio::time::timeout(StdDuration::from_millis(1500), thoughts.recv())
            .await
            .expect("task should fire")
            .unwrap();
        scheduler.stop().await;
    }

    let store = Arc::new(GraphStore::open(&db_path).unwrap());
    let (scheduler, _thoughts) = TaskSchedulerService::new(store, &fast_config());
    scheduler.start().await;
    assert!(scheduler.active_tasks().await.is_empty());
    scheduler.stop().await;
}

#[tokio::test]
async fn cancelled_tasks_stop_existing() {
    let store = Arc::new(GraphStore::open_in_memory().unwrap());
    let (scheduler, _thoughts) = TaskSchedulerService::new(store, &fast_config());

    let task = scheduler
        .schedule_task(
            "doomed",
            "never runs",
            "x",
            None,
            Some(Utc::now() + Duration::hours(1)),
            None,
        )
        .await
        .unwrap();

    assert!(scheduler.cancel_task(&task.task_id).await);
    assert!(scheduler.get_task(&task.task_id).await.is_none());
    assert!(!scheduler.cancel_task(&task.task_id).await);
}
