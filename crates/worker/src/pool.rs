use std::sync::Arc;
use std::time::Duration;

use crontask_config::ExecutorConfig;
use crontask_domain::TaskEngine;
use crontask_errors::SchedulerResult;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::TaskExecutor;
use crate::registry::TaskRegistry;
use crate::shutdown::ShutdownManager;

#[derive(Default)]
struct PoolState {
    shutdown: Option<ShutdownManager>,
    workers: Vec<JoinHandle<()>>,
}

/// 执行器池：管理一组并发的 [`TaskExecutor`]
///
/// `stop` 只发出关闭信号，正在执行的任务会跑完；`wait` 等待所有 worker 退出。
pub struct ExecutorPool {
    engine: Arc<dyn TaskEngine>,
    registry: Arc<TaskRegistry>,
    config: ExecutorConfig,
    name_prefix: String,
    state: Mutex<PoolState>,
}

impl ExecutorPool {
    pub fn new(
        engine: Arc<dyn TaskEngine>,
        registry: Arc<TaskRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        let name_prefix = config
            .name_prefix
            .clone()
            .unwrap_or_else(default_name_prefix);
        Self {
            engine,
            registry,
            config,
            name_prefix,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    /// 启动 `worker_count` 个 worker。已在运行时忽略本次调用。
    pub async fn start(&self, worker_count: usize) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(shutdown) = &state.shutdown {
            if !shutdown.is_shutdown() {
                warn!("执行器池已在运行，忽略重复启动");
                return Ok(());
            }
        }

        let worker_count = worker_count.max(1);
        let shutdown = ShutdownManager::new();
        let stagger_ms = self.config.startup_stagger_ms;
        let idle_interval = Duration::from_millis(self.config.idle_interval_ms);

        // 上一轮的 worker 可能还在执行最后一批任务，句柄留给 wait
        state.workers.retain(|handle| !handle.is_finished());

        for index in 0..worker_count {
            let executor = TaskExecutor::new(
                format!("{}-{}", self.name_prefix, index),
                Arc::clone(&self.engine),
                Arc::clone(&self.registry),
                self.config.batch_size,
                idle_interval,
            );
            let mut startup_rx = shutdown.subscribe();
            let worker_rx = shutdown.subscribe();
            let delay = startup_delay(stagger_ms, index);

            let handle = tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = startup_rx.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                executor.run(worker_rx).await;
            });
            state.workers.push(handle);
        }

        state.shutdown = Some(shutdown);
        info!(
            "执行器池已启动: prefix={}, workers={}",
            self.name_prefix, worker_count
        );
        Ok(())
    }

    /// 发出关闭信号，可重复调用
    pub async fn stop(&self) {
        let state = self.state.lock().await;
        match &state.shutdown {
            Some(shutdown) if !shutdown.is_shutdown() => {
                info!("停止执行器池: {}", self.name_prefix);
                shutdown.shutdown();
            }
            _ => {}
        }
    }

    /// 等待所有 worker 退出，包括重启前那一轮尚未退出的
    pub async fn wait(&self) {
        let workers = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.workers)
        };

        for handle in workers {
            if let Err(e) = handle.await {
                warn!("worker 异常退出: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state
            .shutdown
            .as_ref()
            .map(|shutdown| !shutdown.is_shutdown())
            .unwrap_or(false)
    }
}

fn default_name_prefix() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

/// 第 `index` 个 worker 的启动延迟：按序错开，再加最多一半间隔的随机抖动
fn startup_delay(stagger_ms: u64, index: usize) -> Duration {
    if stagger_ms == 0 || index == 0 {
        return Duration::ZERO;
    }
    let jitter = rand::rng().random_range(0..=stagger_ms / 2);
    Duration::from_millis(stagger_ms * index as u64 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_delay_bounds() {
        assert_eq!(startup_delay(200, 0), Duration::ZERO);
        assert_eq!(startup_delay(0, 3), Duration::ZERO);

        for _ in 0..20 {
            let delay = startup_delay(200, 2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_default_name_prefix_contains_pid() {
        let prefix = default_name_prefix();
        assert!(prefix.ends_with(&format!("-{}", std::process::id())));
    }
}
