//! Repository error helpers with task context
//!
//! 把 sqlx 错误转换为 [`SchedulerError`]，并在日志中带上操作类型和任务身份。
//! 唯一约束冲突单独映射为 `DuplicateTask`，调用方据此区分“任务已存在”。

use chrono::{DateTime, Utc};
use crontask_domain::TaskIdentity;
use crontask_errors::SchedulerError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::{error, instrument, warn};

/// 任务表唯一约束名称
pub const TASK_IDENTITY_CONSTRAINT: &str = "uq_crontask_task_ident";

/// Operation context for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Claim,
    Transition,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "列表查询"),
            RepositoryOperation::Claim => write!(f, "认领"),
            RepositoryOperation::Transition => write!(f, "状态流转"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// Context information for task engine operations
#[derive(Debug, Clone)]
pub struct TaskOperationContext {
    pub operation: RepositoryOperation,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
    pub task_attr: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            task_id: None,
            task_name: None,
            task_attr: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_identity(mut self, identity: &TaskIdentity) -> Self {
        self.task_name = Some(identity.task_name.clone());
        self.task_attr = Some(identity.task_attr.clone());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.task_id, &self.task_name, &self.task_attr) {
            (Some(id), Some(name), Some(attr)) => format!("任务 '{name}' [{attr}] (ID: {id})"),
            (None, Some(name), Some(attr)) => format!("任务 '{name}' [{attr}]"),
            (Some(id), _, _) => format!("任务 (ID: {id})"),
            (None, Some(name), None) => format!("任务 '{name}'"),
            _ => "任务".to_string(),
        }
    }
}

/// Error helpers for task engine operations
pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    #[instrument(skip_all, fields(
        operation = %context.operation,
        task_id = ?context.task_id,
        task_name = ?context.task_name,
        task_attr = ?context.task_attr,
    ))]
    pub fn task_database_error(context: TaskOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        if let SqlxError::Database(db_error) = &error {
            let identity_conflict = db_error.is_unique_violation()
                && db_error
                    .constraint()
                    .map(|c| c == TASK_IDENTITY_CONSTRAINT)
                    .unwrap_or(true);
            if identity_conflict {
                warn!("{}{}时发生唯一约束冲突: 任务已存在", operation_desc, entity_desc);
                return SchedulerError::duplicate_task(
                    context.task_name.unwrap_or_default(),
                    context.task_attr.unwrap_or_default(),
                );
            }
        }

        let error_msg = match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => format!(
                    "{operation_desc}{entity_desc}时发生数据库约束冲突: {constraint}"
                ),
                None => format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}"),
            },
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };

        error!(error = %error, "{}", error_msg);
        SchedulerError::Database(error)
    }

    pub fn task_serialization_error(
        context: TaskOperationContext,
        error: serde_json::Error,
    ) -> SchedulerError {
        let error_msg = format!(
            "{}{}时序列化失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!("{}", error_msg);
        SchedulerError::Serialization(error_msg)
    }
}

/// Macro for creating task operation context easily
#[macro_export]
macro_rules! task_context {
    ($operation:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
    };
    ($operation:expr, task_id = $task_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_task_id($task_id)
    };
    ($operation:expr, identity = $identity:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_identity($identity)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let identity = TaskIdentity::new("jobs.send_email:run", "user-42");
        let context = TaskOperationContext::new(RepositoryOperation::Create).with_identity(&identity);
        assert_eq!(
            context.entity_description(),
            "任务 'jobs.send_email:run' [user-42]"
        );

        let context = context.with_task_id(7);
        assert_eq!(
            context.entity_description(),
            "任务 'jobs.send_email:run' [user-42] (ID: 7)"
        );

        let context = TaskOperationContext::new(RepositoryOperation::Claim);
        assert_eq!(context.entity_description(), "任务");
    }

    #[test]
    fn test_non_constraint_errors_stay_database_errors() {
        let context = task_context!(RepositoryOperation::Read, task_id = 1);
        let err = RepositoryErrorHelpers::task_database_error(context, SqlxError::PoolTimedOut);
        assert!(matches!(err, SchedulerError::Database(SqlxError::PoolTimedOut)));
        assert!(!err.is_duplicate());
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(RepositoryOperation::Claim.to_string(), "认领");
        assert_eq!(RepositoryOperation::Create.to_string(), "创建");
    }
}
