//! 进程内置的任务处理器

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Duration;
use crontask_domain::{
    DispatchMessage, DistributedLock, MessagePublisher, Priority, TaskContext, TaskInvocation,
    TaskName, TaskOutcome,
};
use crontask_errors::SchedulerResult;
use crontask_worker::{TaskHandler, TaskRegistry};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub const ECHO_HANDLER: &str = "builtin:echo";
pub const DISPATCH_HANDLER: &str = "builtin:dispatch";

/// 打印调用参数
///
/// `kwargs.retry_in_seconds` 存在时，同一条任务第一次执行会改期到若干秒后，
/// 第二次执行才完成。配置了分布式锁时，执行期间持有以任务身份命名的锁。
pub struct EchoHandler {
    lock: Option<Arc<dyn DistributedLock>>,
    retried: Mutex<HashSet<i64>>,
}

impl EchoHandler {
    pub fn new(lock: Option<Arc<dyn DistributedLock>>) -> Self {
        Self {
            lock,
            retried: Mutex::new(HashSet::new()),
        }
    }

    /// 第一次返回 true 并记下任务 id，第二次返回 false 并清掉记录
    fn first_attempt(&self, task_id: i64) -> anyhow::Result<bool> {
        let mut retried = self
            .retried
            .lock()
            .map_err(|_| anyhow!("echo handler state poisoned"))?;
        if retried.remove(&task_id) {
            Ok(false)
        } else {
            retried.insert(task_id);
            Ok(true)
        }
    }

    fn echo(&self, ctx: &TaskContext, invocation: &TaskInvocation) -> anyhow::Result<TaskOutcome> {
        info!(
            "echo: args={}, kwargs={}, extra={}",
            serde_json::Value::Array(invocation.args.clone()),
            serde_json::Value::Object(invocation.kwargs.clone()),
            serde_json::Value::Object(ctx.extra.clone())
        );

        let Some(seconds) = invocation.kwarg("retry_in_seconds").and_then(Value::as_i64) else {
            return Ok(TaskOutcome::Done);
        };
        if self.first_attempt(ctx.task_id)? {
            Ok(TaskOutcome::retry_after(Duration::seconds(seconds.max(0))))
        } else {
            Ok(TaskOutcome::Done)
        }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(
        &self,
        ctx: TaskContext,
        invocation: TaskInvocation,
    ) -> anyhow::Result<TaskOutcome> {
        let lease = match &self.lock {
            Some(lock) => Some(
                lock.acquire(&format!("{}:{}", ctx.task_name, ctx.task_attr))
                    .await?,
            ),
            None => None,
        };

        let outcome = self.echo(&ctx, &invocation);

        // 处理失败时同样释放租约
        if let (Some(lock), Some(lease)) = (&self.lock, lease) {
            match lock.release(lease).await {
                Ok(true) => {}
                Ok(false) => warn!("echo: 释放锁时租约已丢失"),
                Err(e) if outcome.is_ok() => return Err(e.into()),
                Err(e) => warn!("echo: 释放锁失败: {}", e),
            }
        }

        outcome
    }
}

/// 把调用转发到消息队列，由其他进程消费
pub struct DispatchHandler {
    publisher: Option<Arc<dyn MessagePublisher>>,
}

impl DispatchHandler {
    pub fn new(publisher: Option<Arc<dyn MessagePublisher>>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl TaskHandler for DispatchHandler {
    async fn execute(
        &self,
        ctx: TaskContext,
        invocation: TaskInvocation,
    ) -> anyhow::Result<TaskOutcome> {
        let Some(publisher) = &self.publisher else {
            bail!("消息队列未启用，无法转发任务 {}", ctx.task_name);
        };

        let handler = invocation
            .kwarg("handler")
            .and_then(Value::as_str)
            .context("缺少 kwargs.handler")?;
        TaskName::parse(handler)?;

        let kwargs = match invocation.kwarg("kwargs") {
            Some(Value::Object(kwargs)) => kwargs.clone(),
            Some(other) => bail!("kwargs.kwargs 必须是对象: {other}"),
            None => Map::new(),
        };
        let priority = invocation
            .kwarg("priority")
            .and_then(Value::as_u64)
            .map(|value| Priority::new(value.min(u8::MAX as u64) as u8));

        let message = DispatchMessage::new(handler, invocation.args.clone(), kwargs);
        publisher
            .publish(&message, priority)
            .await
            .with_context(|| format!("转发 {handler} 失败"))?;

        info!("已转发调用: {}", handler);
        Ok(TaskOutcome::Done)
    }
}

/// 注册内置处理器
pub async fn register_builtin_handlers(
    registry: &TaskRegistry,
    publisher: Option<Arc<dyn MessagePublisher>>,
    lock: Option<Arc<dyn DistributedLock>>,
) -> SchedulerResult<()> {
    registry
        .register(ECHO_HANDLER, Arc::new(EchoHandler::new(lock)))
        .await?;
    registry
        .register_factory(DISPATCH_HANDLER, move || {
            let handler: Arc<dyn TaskHandler> =
                Arc::new(DispatchHandler::new(publisher.clone()));
            Ok(handler)
        })
        .await?;
    Ok(())
}
