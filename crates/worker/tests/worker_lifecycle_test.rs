use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use crontask_config::{DatabaseConfig, ExecutorConfig};
use crontask_domain::{NewTask, TaskEngine, TaskIdentity, TaskOutcome, TaskStatus};
use crontask_infrastructure::DatabaseManager;
use crontask_worker::{handler_fn, ExecutorPool, TaskRegistry};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

async fn memory_engine() -> Result<(DatabaseManager, Arc<dyn TaskEngine>)> {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::new(&config).await?;
    let engine = manager.task_engine();
    Ok((manager, engine))
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        worker_count: 2,
        idle_interval_ms: 20,
        startup_stagger_ms: 0,
        name_prefix: Some("lifecycle".to_string()),
        ..ExecutorConfig::default()
    }
}

async fn wait_until(counter: &AtomicUsize, expected: usize) -> Result<()> {
    timeout(StdDuration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < expected {
            sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_pool_executes_due_tasks() -> Result<()> {
    let (_manager, engine) = memory_engine().await?;
    let registry = Arc::new(TaskRegistry::new());
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    registry
        .register(
            "jobs.send_email:run",
            handler_fn(move |_ctx, _inv| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(TaskOutcome::Done) }
            }),
        )
        .await?;

    for user in 0..5 {
        engine
            .create(&NewTask::new("jobs.send_email:run", format!("user-{user}")))
            .await?;
    }

    let pool = ExecutorPool::new(Arc::clone(&engine), registry, fast_config());
    pool.start(2).await?;
    wait_until(&done, 5).await?;
    pool.stop().await;
    pool.wait().await;

    assert_eq!(done.load(Ordering::SeqCst), 5);
    assert!(engine.list(&Default::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_lets_in_flight_task_finish() -> Result<()> {
    let (_manager, engine) = memory_engine().await?;
    let registry = Arc::new(TaskRegistry::new());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_c, finished_c) = (Arc::clone(&started), Arc::clone(&finished));
    registry
        .register(
            "jobs.export:run",
            handler_fn(move |_ctx, _inv| {
                let started = Arc::clone(&started_c);
                let finished = Arc::clone(&finished_c);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    sleep(StdDuration::from_millis(300)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskOutcome::Done)
                }
            }),
        )
        .await?;

    engine.create(&NewTask::new("jobs.export:run", "big")).await?;

    let pool = ExecutorPool::new(Arc::clone(&engine), registry, fast_config());
    pool.start(1).await?;
    wait_until(&started, 1).await?;

    pool.stop().await;
    assert!(!pool.is_running().await);
    pool.wait().await;

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(engine
        .find(&TaskIdentity::new("jobs.export:run", "big"))
        .await?
        .is_none());

    // 停止后不再认领新任务
    engine.create(&NewTask::new("jobs.export:run", "late")).await?;
    sleep(StdDuration::from_millis(100)).await;
    let late = engine
        .find(&TaskIdentity::new("jobs.export:run", "late"))
        .await?
        .expect("late task should still exist");
    assert_eq!(late.status, TaskStatus::Waiting);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_is_repeatable() -> Result<()> {
    let (_manager, engine) = memory_engine().await?;
    let pool = ExecutorPool::new(engine, Arc::new(TaskRegistry::new()), fast_config());
    assert_eq!(pool.name_prefix(), "lifecycle");
    assert!(!pool.is_running().await);

    pool.start(2).await?;
    pool.start(2).await?;
    assert!(pool.is_running().await);

    pool.stop().await;
    pool.stop().await;
    assert!(!pool.is_running().await);

    timeout(StdDuration::from_secs(5), pool.wait()).await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_during_startup_stagger() -> Result<()> {
    let (_manager, engine) = memory_engine().await?;
    let config = ExecutorConfig {
        startup_stagger_ms: 10_000,
        ..fast_config()
    };
    let pool = ExecutorPool::new(engine, Arc::new(TaskRegistry::new()), config);

    pool.start(3).await?;
    pool.stop().await;
    timeout(StdDuration::from_secs(2), pool.wait()).await?;
    Ok(())
}

#[tokio::test]
async fn test_wait_after_restart_covers_previous_workers() -> Result<()> {
    let (_manager, engine) = memory_engine().await?;
    let registry = Arc::new(TaskRegistry::new());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let (started_c, finished_c, release_c) = (
        Arc::clone(&started),
        Arc::clone(&finished),
        Arc::clone(&release),
    );
    registry
        .register(
            "jobs.export:run",
            handler_fn(move |_ctx, _inv| {
                let started = Arc::clone(&started_c);
                let finished = Arc::clone(&finished_c);
                let release = Arc::clone(&release_c);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskOutcome::Done)
                }
            }),
        )
        .await?;

    engine.create(&NewTask::new("jobs.export:run", "big")).await?;

    let pool = ExecutorPool::new(Arc::clone(&engine), registry, fast_config());
    pool.start(1).await?;
    wait_until(&started, 1).await?;

    // 第一轮的 worker 还卡在任务里时重启，再停止
    pool.stop().await;
    pool.start(1).await?;
    assert!(pool.is_running().await);
    pool.stop().await;

    let notifier = Arc::clone(&release);
    tokio::spawn(async move {
        sleep(StdDuration::from_millis(200)).await;
        notifier.notify_one();
    });

    timeout(StdDuration::from_secs(5), pool.wait()).await?;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(engine
        .find(&TaskIdentity::new("jobs.export:run", "big"))
        .await?
        .is_none());
    Ok(())
}
