use thiserror::Error;


#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务已存在: {task_name} [{task_attr}]")]
    DuplicateTask { task_name: String, task_attr: String },
    #[error("无效的任务名称: {0}")]
    InvalidTaskName(String),
    #[error("任务处理器未注册: {0}")]
    HandlerNotFound(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("分布式锁错误: {0}")]
    Lock(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn duplicate_task<N: Into<String>, A: Into<String>>(task_name: N, task_attr: A) -> Self {
        Self::DuplicateTask {
            task_name: task_name.into(),
            task_attr: task_attr.into(),
        }
    }
    pub fn handler_not_found<S: Into<String>>(task_name: S) -> Self {
        Self::HandlerNotFound(task_name.into())
    }
    pub fn invalid_task_name<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskName(msg.into())
    }

    /// 创建任务时 `(task_name, task_attr)` 冲突，调用方应按正常流程处理
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SchedulerError::DuplicateTask { .. })
    }

    /// 存储或外部连接的暂时性故障，worker 下一轮会重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::MessageQueue(_)
                | SchedulerError::Lock(_)
                | SchedulerError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
