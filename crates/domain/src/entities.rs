use chrono::{DateTime, SubsecRound, Utc};
use crontask_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// 可调度的任务记录，对应存储中的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub trace_id: Uuid,
    pub task_name: String, // <module>:<function>
    pub task_attr: String, // 同名任务的区分标识，例如用户ID
    pub task_args: Vec<Value>,
    pub task_kwargs: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub version: i64,
    pub remark: Option<String>,
    pub exc_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task_name.clone(), self.task_attr.clone())
    }

    pub fn entity_description(&self) -> String {
        format!("任务 '{}' [{}] (ID: {})", self.task_name, self.task_attr, self.id)
    }
}

/// 任务状态
///
/// ```text
/// waiting --claim--> pending --begin_run--> running
/// running --Done--> [deleted]
/// running --Failed--> failed
/// running --RetryAt(t)--> waiting
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Pending,
    Running,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid task status: {s}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<TaskStatus>()?)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务身份：`(task_name, task_attr)` 在记录存在期间唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub task_name: String,
    pub task_attr: String,
}

impl TaskIdentity {
    pub fn new<N: Into<String>, A: Into<String>>(task_name: N, task_attr: A) -> Self {
        Self {
            task_name: task_name.into(),
            task_attr: task_attr.into(),
        }
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.task_name, self.task_attr)
    }
}

/// 校验过的处理器名称，格式为 `<module>:<function>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskName {
    module: String,
    function: String,
}

impl TaskName {
    pub fn parse(name: &str) -> SchedulerResult<Self> {
        let mut parts = name.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(function), None)
                if !module.trim().is_empty() && !function.trim().is_empty() =>
            {
                Ok(Self {
                    module: module.to_string(),
                    function: function.to_string(),
                })
            }
            _ => Err(SchedulerError::invalid_task_name(name)),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

/// 创建任务的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_name: String,
    pub task_attr: String,
    /// 为空时立即可执行
    pub run_at: Option<DateTime<Utc>>,
    pub task_args: Vec<Value>,
    pub task_kwargs: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub remark: Option<String>,
}

impl NewTask {
    pub fn new<N: Into<String>, A: Into<String>>(task_name: N, task_attr: A) -> Self {
        Self {
            task_name: task_name.into(),
            task_attr: task_attr.into(),
            run_at: None,
            task_args: Vec::new(),
            task_kwargs: Map::new(),
            extra: Map::new(),
            remark: None,
        }
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.task_args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.task_kwargs = kwargs;
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_remark<S: Into<String>>(mut self, remark: S) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task_name.clone(), self.task_attr.clone())
    }

    /// 校验名称格式并返回最终生效的执行时间
    pub fn validate(&self) -> SchedulerResult<DateTime<Utc>> {
        TaskName::parse(&self.task_name)?;
        if self.task_attr.is_empty() {
            return Err(SchedulerError::invalid_task_name(format!(
                "{}: task_attr 不能为空",
                self.task_name
            )));
        }
        Ok(normalize_timestamp(self.run_at.unwrap_or_else(Utc::now)))
    }
}

/// 部分更新：为 `None` 的字段保持不变
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub run_at: Option<DateTime<Utc>>,
    pub task_args: Option<Vec<Value>>,
    pub task_kwargs: Option<Map<String, Value>>,
    pub extra: Option<Map<String, Value>>,
    pub remark: Option<String>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.run_at.is_none()
            && self.task_args.is_none()
            && self.task_kwargs.is_none()
            && self.extra.is_none()
            && self.remark.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_name: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 写入存储前统一截断到微秒，PostgreSQL 与 SQLite 读回的值一致
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_task_name_parse() {
        let name = TaskName::parse("jobs.send_email:run").unwrap();
        assert_eq!(name.module(), "jobs.send_email");
        assert_eq!(name.function(), "run");
        assert_eq!(name.to_string(), "jobs.send_email:run");

        assert!(TaskName::parse("no_separator").is_err());
        assert!(TaskName::parse(":run").is_err());
        assert!(TaskName::parse("jobs:").is_err());
        assert!(TaskName::parse("a:b:c").is_err());
    }

    #[test]
    fn test_task_status_round_trip_strings() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("success".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_new_task_defaults_run_at_to_now() {
        let before = Utc::now() - Duration::seconds(1);
        let run_at = NewTask::new("jobs.a:run", "1").validate().unwrap();
        assert!(run_at >= before);
        assert!(run_at <= Utc::now());
    }

    #[test]
    fn test_new_task_rejects_bad_identity() {
        assert!(NewTask::new("bad-name", "1").validate().is_err());
        assert!(NewTask::new("jobs.a:run", "").validate().is_err());
    }

    #[test]
    fn test_normalize_timestamp_truncates_to_micros() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + Duration::nanoseconds(1_234_567);
        let normalized = normalize_timestamp(ts);
        assert_eq!(normalized.timestamp_subsec_nanos(), 1_234_000);
    }

    #[test]
    fn test_task_update_is_empty() {
        assert!(TaskUpdate::default().is_empty());
        let update = TaskUpdate {
            remark: Some("note".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
