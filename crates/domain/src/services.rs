//! # 任务调用方接口
//!
//! 业务代码通过 [`TaskService`] 登记、修改和取消延迟任务。
//! “任务已存在”与“任务已不存在”都是正常的控制流，以独立的结果类型返回，
//! 与真正的存储错误区分开。
//!
//! ```ignore
//! let service = TaskService::new(engine);
//! ScheduledTask::new("jobs.send_email:run", "user-42")
//!     .run_at(Utc::now() + Duration::minutes(10))
//!     .params(vec![json!("a@example.com")], Map::new())
//!     .add(&service)
//!     .await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crontask_errors::SchedulerResult;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::entities::{NewTask, TaskFilter, TaskIdentity, TaskRecord, TaskUpdate};
use crate::repositories::TaskEngine;

#[derive(Debug, Clone)]
pub enum AddTaskOutcome {
    Created(TaskRecord),
    AlreadyExists,
}

impl AddTaskOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, AddTaskOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(u64),
    NotFound,
}

#[derive(Clone)]
pub struct TaskService {
    engine: Arc<dyn TaskEngine>,
}

impl TaskService {
    pub fn new(engine: Arc<dyn TaskEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Arc<dyn TaskEngine> {
        Arc::clone(&self.engine)
    }

    #[instrument(skip(self, task), fields(task_name = %task.task_name, task_attr = %task.task_attr))]
    pub async fn add_task(&self, task: NewTask) -> SchedulerResult<AddTaskOutcome> {
        info!(
            "添加任务: run_at={:?}, args={:?}, kwargs={:?}, extra={:?}, remark={:?}",
            task.run_at, task.task_args, task.task_kwargs, task.extra, task.remark
        );
        match self.engine.create(&task).await {
            Ok(record) => {
                info!("添加任务成功: {}", record.entity_description());
                Ok(AddTaskOutcome::Created(record))
            }
            Err(e) if e.is_duplicate() => {
                warn!("添加任务失败，任务已存在: {}", task.identity());
                Ok(AddTaskOutcome::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, changes), fields(task = %identity))]
    pub async fn update_task(
        &self,
        identity: &TaskIdentity,
        changes: TaskUpdate,
    ) -> SchedulerResult<u64> {
        if changes.is_empty() {
            info!("更新任务结束，没有需要更新的字段");
            return Ok(0);
        }
        let updated = self.engine.update(identity, &changes).await?;
        info!("更新任务结束: updated_task_count={}", updated);
        Ok(updated)
    }

    #[instrument(skip(self), fields(task = %identity))]
    pub async fn cancel_task(&self, identity: &TaskIdentity) -> SchedulerResult<CancelOutcome> {
        let (cancelled, count) = self.engine.cancel(identity).await?;
        info!(
            "取消任务结束: canceled={}, canceled_task_count={}",
            cancelled, count
        );
        if cancelled {
            Ok(CancelOutcome::Cancelled(count))
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    pub async fn find_task(&self, identity: &TaskIdentity) -> SchedulerResult<Option<TaskRecord>> {
        self.engine.find(identity).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        self.engine.list(filter).await
    }
}

/// 以链式调用描述一个延迟任务，然后登记、修改或取消它
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    identity: TaskIdentity,
    run_at: Option<DateTime<Utc>>,
    extra: Option<Map<String, Value>>,
    remark: Option<String>,
    task_args: Option<Vec<Value>>,
    task_kwargs: Option<Map<String, Value>>,
}

impl ScheduledTask {
    pub fn new<N: Into<String>, A: Into<String>>(task_name: N, task_attr: A) -> Self {
        Self {
            identity: TaskIdentity::new(task_name, task_attr),
            run_at: None,
            extra: None,
            remark: None,
            task_args: None,
            task_kwargs: None,
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn remark<S: Into<String>>(mut self, remark: S) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn params(mut self, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        self.task_args = Some(args);
        self.task_kwargs = Some(kwargs);
        self
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            task_name: self.identity.task_name.clone(),
            task_attr: self.identity.task_attr.clone(),
            run_at: self.run_at,
            task_args: self.task_args.clone().unwrap_or_default(),
            task_kwargs: self.task_kwargs.clone().unwrap_or_default(),
            extra: self.extra.clone().unwrap_or_default(),
            remark: self.remark.clone(),
        }
    }

    pub fn to_update(&self) -> TaskUpdate {
        TaskUpdate {
            run_at: self.run_at,
            task_args: self.task_args.clone(),
            task_kwargs: self.task_kwargs.clone(),
            extra: self.extra.clone(),
            remark: self.remark.clone(),
        }
    }

    pub async fn add(&self, service: &TaskService) -> SchedulerResult<AddTaskOutcome> {
        service.add_task(self.to_new_task()).await
    }

    pub async fn update(&self, service: &TaskService) -> SchedulerResult<u64> {
        service.update_task(&self.identity, self.to_update()).await
    }

    pub async fn cancel(&self, service: &TaskService) -> SchedulerResult<CancelOutcome> {
        service.cancel_task(&self.identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskStatus;
    use crate::repositories::MockTaskEngine;
    use crontask_errors::SchedulerError;
    use serde_json::json;
    use uuid::Uuid;

    fn record_for(task: &NewTask) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: 1,
            trace_id: Uuid::new_v4(),
            task_name: task.task_name.clone(),
            task_attr: task.task_attr.clone(),
            task_args: task.task_args.clone(),
            task_kwargs: task.task_kwargs.clone(),
            extra: task.extra.clone(),
            run_at: task.run_at.unwrap_or(now),
            status: TaskStatus::Waiting,
            version: 0,
            remark: task.remark.clone(),
            exc_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_add_task_created() {
        let mut engine = MockTaskEngine::new();
        engine
            .expect_create()
            .times(1)
            .returning(|task| Ok(record_for(task)));
        let service = TaskService::new(Arc::new(engine));

        let outcome = ScheduledTask::new("jobs.send_email:run", "user-42")
            .params(vec![json!("a@example.com")], Map::new())
            .add(&service)
            .await
            .unwrap();
        match outcome {
            AddTaskOutcome::Created(record) => {
                assert_eq!(record.task_attr, "user-42");
                assert_eq!(record.task_args, vec![json!("a@example.com")]);
            }
            AddTaskOutcome::AlreadyExists => panic!("expected a new task"),
        }
    }

    #[tokio::test]
    async fn test_add_task_duplicate_is_benign() {
        let mut engine = MockTaskEngine::new();
        engine.expect_create().returning(|task| {
            Err(SchedulerError::duplicate_task(
                task.task_name.clone(),
                task.task_attr.clone(),
            ))
        });
        let service = TaskService::new(Arc::new(engine));

        let outcome = service
            .add_task(NewTask::new("jobs.send_email:run", "user-42"))
            .await
            .unwrap();
        assert!(!outcome.is_created());
    }

    #[tokio::test]
    async fn test_add_task_other_errors_are_reported() {
        let mut engine = MockTaskEngine::new();
        engine
            .expect_create()
            .returning(|_| Err(SchedulerError::Database(sqlx::Error::PoolTimedOut)));
        let service = TaskService::new(Arc::new(engine));

        let result = service
            .add_task(NewTask::new("jobs.send_email:run", "user-42"))
            .await;
        assert!(matches!(result, Err(SchedulerError::Database(_))));
    }

    #[tokio::test]
    async fn test_update_with_nothing_to_change_skips_store() {
        let mut engine = MockTaskEngine::new();
        engine.expect_update().times(0);
        let service = TaskService::new(Arc::new(engine));

        let updated = ScheduledTask::new("jobs.send_email:run", "user-42")
            .update(&service)
            .await
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn test_update_passes_only_set_fields() {
        let mut engine = MockTaskEngine::new();
        engine
            .expect_update()
            .withf(|identity, changes| {
                identity.task_attr == "user-42"
                    && changes.remark.as_deref() == Some("moved")
                    && changes.task_args.is_none()
                    && changes.run_at.is_none()
            })
            .returning(|_, _| Ok(1));
        let service = TaskService::new(Arc::new(engine));

        let updated = ScheduledTask::new("jobs.send_email:run", "user-42")
            .remark("moved")
            .update(&service)
            .await
            .unwrap();
        assert_eq!(updated, 1);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let mut engine = MockTaskEngine::new();
        let mut calls = 0;
        engine.expect_cancel().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok((true, 1))
            } else {
                Ok((false, 0))
            }
        });
        let service = TaskService::new(Arc::new(engine));
        let task = ScheduledTask::new("jobs.send_email:run", "user-42");

        assert_eq!(task.cancel(&service).await.unwrap(), CancelOutcome::Cancelled(1));
        assert_eq!(task.cancel(&service).await.unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn test_scheduled_task_defaults() {
        let task = ScheduledTask::new("jobs.a:run", "1").to_new_task();
        assert!(task.run_at.is_none());
        assert!(task.task_args.is_empty());
        assert!(task.task_kwargs.is_empty());
        assert!(task.extra.is_empty());
    }
}
