//! 任务引擎抽象
//!
//! 所有协调都通过存储的条件更新完成：条件不满足时返回受影响行数 0，
//! 调用方将其视为“跳过”，而不是错误。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crontask_errors::SchedulerResult;

use crate::entities::{NewTask, TaskFilter, TaskIdentity, TaskRecord, TaskUpdate};

/// 默认单次认领的任务数量
pub const DEFAULT_CLAIM_BATCH_SIZE: u32 = 20;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// 插入一条 waiting 记录（version = 0）。身份冲突返回 `DuplicateTask`。
    async fn create(&self, task: &NewTask) -> SchedulerResult<TaskRecord>;

    /// 仅更新 waiting 状态的记录，返回受影响行数
    async fn update(&self, identity: &TaskIdentity, changes: &TaskUpdate) -> SchedulerResult<u64>;

    /// 无条件按身份删除，返回 `(是否删除, 删除行数)`
    async fn cancel(&self, identity: &TaskIdentity) -> SchedulerResult<(bool, u64)>;

    /// 选出到期的 waiting 记录并逐条以 version 乐观锁推进到 pending，
    /// 只返回推进成功的记录
    async fn claim_batch(&self, batch_size: u32) -> SchedulerResult<Vec<TaskRecord>>;

    /// pending -> running，返回 0 表示不要执行。
    ///
    /// 同时匹配认领到的记录 id：同一身份被取消后重新登记的记录有新的 id，
    /// 旧认领不会推进它。
    async fn begin_run(&self, task_id: i64, identity: &TaskIdentity) -> SchedulerResult<u64>;

    /// 执行成功后删除 running 记录，同样按 id 匹配
    async fn complete(&self, task_id: i64, identity: &TaskIdentity) -> SchedulerResult<u64>;

    /// 无条件标记为 failed 并保存失败详情
    async fn fail(&self, task_id: i64, exc_info: &str) -> SchedulerResult<u64>;

    /// running -> waiting，并设置新的 run_at
    async fn reschedule(&self, task_id: i64, next_run_at: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn find(&self, identity: &TaskIdentity) -> SchedulerResult<Option<TaskRecord>>;

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>>;
}
