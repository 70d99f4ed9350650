//! 单个 worker 的执行循环
//!
//! 每一轮：认领一批到期任务 -> 逐条 begin_run -> 调用处理器 -> 按结果落库。
//! 所有状态推进都是条件更新，受影响行数为 0 说明任务已被取消或被别人接手，
//! 此时放弃该任务而不是报错。

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crontask_domain::{TaskContext, TaskEngine, TaskInvocation, TaskOutcome, TaskRecord};
use crontask_errors::SchedulerResult;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::TaskRegistry;

/// 一条任务执行完后的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    /// 执行成功，记录已删除
    Completed,
    /// 回到 waiting，下次执行时间
    Rescheduled(DateTime<Utc>),
    /// 记录被标记为 failed
    Failed(String),
    /// 条件更新未命中（已取消或已被推进），本 worker 不再处理
    Abandoned,
}

impl TaskDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            TaskDisposition::Completed => "completed",
            TaskDisposition::Rescheduled(_) => "rescheduled",
            TaskDisposition::Failed(_) => "failed",
            TaskDisposition::Abandoned => "abandoned",
        }
    }
}

pub struct TaskExecutor {
    name: String,
    engine: Arc<dyn TaskEngine>,
    registry: Arc<TaskRegistry>,
    batch_size: u32,
    idle_interval: Duration,
}

impl TaskExecutor {
    pub fn new(
        name: impl Into<String>,
        engine: Arc<dyn TaskEngine>,
        registry: Arc<TaskRegistry>,
        batch_size: u32,
        idle_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            registry,
            batch_size: batch_size.max(1),
            idle_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 主循环：直到收到关闭信号。已认领的一批任务会执行完再退出。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("任务执行器 {} 启动", self.name);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = match self.run_once().await {
                Ok(count) => count,
                Err(e) if e.is_retryable() => {
                    warn!("任务执行器 {} 认领任务暂时失败，稍后重试: {}", self.name, e);
                    0
                }
                Err(e) => {
                    error!("任务执行器 {} 认领任务失败: {}", self.name, e);
                    0
                }
            };

            if processed > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.idle_interval) => {}
            }
        }

        info!("任务执行器 {} 已停止", self.name);
    }

    /// 认领并执行一批任务，返回本轮认领到的数量
    pub async fn run_once(&self) -> SchedulerResult<usize> {
        let records = self.engine.claim_batch(self.batch_size).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let claimed = records.len();
        counter!("crontask_tasks_claimed_total").increment(claimed as u64);
        debug!("任务执行器 {} 认领到 {} 个任务", self.name, claimed);

        for record in records {
            let description = record.entity_description();
            if let Err(e) = self.execute_task(record).await {
                error!("执行任务 {} 时存储出错: {}", description, e);
            }
        }

        Ok(claimed)
    }

    /// 执行一条已认领（pending）的任务
    pub async fn execute_task(&self, record: TaskRecord) -> SchedulerResult<TaskDisposition> {
        let span = info_span!(
            "task",
            trace_id = %record.trace_id,
            task_id = record.id,
            task_name = %record.task_name,
            task_attr = %record.task_attr,
            worker = %self.name,
        );
        self.execute_in_span(record).instrument(span).await
    }

    async fn execute_in_span(&self, record: TaskRecord) -> SchedulerResult<TaskDisposition> {
        let identity = record.identity();

        let handler = match self.registry.resolve(&record.task_name).await {
            Ok(handler) => handler,
            Err(e) => {
                let detail = e.to_string();
                warn!("任务处理器不可用: {}", detail);
                self.engine.fail(record.id, &detail).await?;
                counter!("crontask_tasks_failed_total").increment(1);
                return Ok(TaskDisposition::Failed(detail));
            }
        };

        if self.engine.begin_run(record.id, &identity).await? == 0 {
            info!("任务已不是 pending 状态，放弃执行");
            counter!("crontask_tasks_abandoned_total").increment(1);
            return Ok(TaskDisposition::Abandoned);
        }

        let ctx = TaskContext::for_record(&record, &self.name);
        let invocation = TaskInvocation::from_record(&record);
        info!(
            "开始执行任务: args={:?}, kwargs={:?}",
            invocation.args, invocation.kwargs
        );

        let started = Instant::now();
        let join = tokio::spawn(
            async move { handler.execute(ctx, invocation).await }.in_current_span(),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match join {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => TaskOutcome::Failed(format!("{e:#}")),
            Err(join_error) if join_error.is_panic() => TaskOutcome::Failed(format!(
                "处理器 panic: {}",
                panic_message(join_error.into_panic().as_ref())
            )),
            Err(join_error) => TaskOutcome::Failed(format!("处理器被中止: {join_error}")),
        };

        histogram!("crontask_task_duration_ms", "outcome" => outcome.label()).record(elapsed_ms);

        let disposition = match outcome {
            TaskOutcome::Done => {
                if self.engine.complete(record.id, &identity).await? == 0 {
                    TaskDisposition::Abandoned
                } else {
                    TaskDisposition::Completed
                }
            }
            TaskOutcome::RetryAt(next_run_at) => {
                if self.engine.reschedule(record.id, next_run_at).await? == 0 {
                    TaskDisposition::Abandoned
                } else {
                    TaskDisposition::Rescheduled(next_run_at)
                }
            }
            TaskOutcome::Failed(detail) => {
                error!("任务执行失败: {}", detail);
                self.engine.fail(record.id, &detail).await?;
                TaskDisposition::Failed(detail)
            }
        };

        match &disposition {
            TaskDisposition::Completed => {
                counter!("crontask_tasks_completed_total").increment(1);
                info!("任务执行完成，耗时 {:.1}ms", elapsed_ms);
            }
            TaskDisposition::Rescheduled(at) => {
                counter!("crontask_tasks_rescheduled_total").increment(1);
                info!("任务重新调度到 {}", at);
            }
            TaskDisposition::Failed(_) => {
                counter!("crontask_tasks_failed_total").increment(1);
            }
            TaskDisposition::Abandoned => {
                counter!("crontask_tasks_abandoned_total").increment(1);
                info!("任务在执行期间被取消或已被推进，结果丢弃");
            }
        }

        Ok(disposition)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
