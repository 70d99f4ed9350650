//! 任务执行期的值对象
//!
//! - [`TaskContext`]: 显式传入处理器的关联上下文（trace_id 等），替代线程局部变量
//! - [`TaskInvocation`]: 处理器的调用参数
//! - [`TaskOutcome`]: 处理器的执行结果，决定记录的去向

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entities::{TaskIdentity, TaskRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub trace_id: Uuid,
    pub task_id: i64,
    pub task_name: String,
    pub task_attr: String,
    pub extra: Map<String, Value>,
    /// 执行该任务的 worker 名称
    pub worker: String,
    pub started_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn for_record(record: &TaskRecord, worker: &str) -> Self {
        Self {
            trace_id: record.trace_id,
            task_id: record.id,
            task_name: record.task_name.clone(),
            task_attr: record.task_attr.clone(),
            extra: record.extra.clone(),
            worker: worker.to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task_name.clone(), self.task_attr.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskInvocation {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            args: record.task_args.clone(),
            kwargs: record.task_kwargs.clone(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// 处理器结果
///
/// 重试通过显式的 `RetryAt` 表达，处理器返回时间戳不再被解读为重试信号。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// 执行完成，记录删除
    Done,
    /// 不早于该时间再次执行，记录回到 waiting
    RetryAt(DateTime<Utc>),
    /// 执行失败，记录保留为 failed 供人工排查
    Failed(String),
}

impl TaskOutcome {
    pub fn retry_after(delay: Duration) -> Self {
        TaskOutcome::RetryAt(Utc::now() + delay)
    }

    pub fn failed<S: Into<String>>(detail: S) -> Self {
        TaskOutcome::Failed(detail.into())
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Done => "done",
            TaskOutcome::RetryAt(_) => "retry",
            TaskOutcome::Failed(_) => "failed",
        }
    }
}
