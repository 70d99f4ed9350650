use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use crontask_domain::{TaskContext, TaskInvocation, TaskOutcome};

/// 任务处理器
///
/// 返回 `Err` 视为执行失败，错误链写入记录的 `exc_info`。
/// 需要稍后重试时返回 [`TaskOutcome::RetryAt`]。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: TaskContext,
        invocation: TaskInvocation,
    ) -> anyhow::Result<TaskOutcome>;
}

/// 把异步闭包包装成处理器
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, TaskInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: TaskContext,
        invocation: TaskInvocation,
    ) -> anyhow::Result<TaskOutcome> {
        (self.f)(ctx, invocation).await
    }
}

/// ```ignore
/// registry.register("jobs.send_email:run", handler_fn(|_ctx, inv| async move {
///     send(inv.arg(0)).await?;
///     Ok(TaskOutcome::Done)
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}
