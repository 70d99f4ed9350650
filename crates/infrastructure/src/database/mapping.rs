//! Shared database mapping utilities
//!
//! PostgreSQL 使用原生 JSONB / TIMESTAMPTZ / UUID 列，SQLite 中这些字段都以 TEXT 保存。

use chrono::{DateTime, SecondsFormat, Utc};
use crontask_domain::{TaskRecord, TaskStatus};
use crontask_errors::{SchedulerError, SchedulerResult};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

/// 两个后端共用的查询列
pub const TASK_COLUMNS: &str = "id, trace_id, task_name, task_attr, task_args, task_kwargs, \
     extra, run_at, status, version, remark, exc_info, created_at, updated_at";

pub struct MappingHelpers;

impl MappingHelpers {
    /// SQLite 中时间统一写成固定 6 位小数的 UTC RFC3339 文本，字典序即时间序
    pub fn sqlite_timestamp(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse_sqlite_timestamp(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<DateTime<Utc>> {
        let text: String = row.try_get(field_name)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| SchedulerError::Serialization(format!("解析时间字段 {field_name} 失败: {e}")))
    }

    pub fn parse_json_sqlite<T: serde::de::DeserializeOwned>(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
    }

    pub fn row_to_task_sqlite(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TaskRecord> {
        let trace_id: String = row.try_get("trace_id")?;
        let trace_id = Uuid::parse_str(&trace_id)
            .map_err(|e| SchedulerError::Serialization(format!("解析 trace_id 失败: {e}")))?;

        Ok(TaskRecord {
            id: row.try_get("id")?,
            trace_id,
            task_name: row.try_get("task_name")?,
            task_attr: row.try_get("task_attr")?,
            task_args: Self::parse_json_sqlite::<Vec<Value>>(row, "task_args")?,
            task_kwargs: Self::parse_json_sqlite::<Map<String, Value>>(row, "task_kwargs")?,
            extra: Self::parse_json_sqlite::<Map<String, Value>>(row, "extra")?,
            run_at: Self::parse_sqlite_timestamp(row, "run_at")?,
            status: row.try_get::<TaskStatus, _>("status")?,
            version: row.try_get("version")?,
            remark: row.try_get("remark")?,
            exc_info: row.try_get("exc_info")?,
            created_at: Self::parse_sqlite_timestamp(row, "created_at")?,
            updated_at: Self::parse_sqlite_timestamp(row, "updated_at")?,
        })
    }

    pub fn row_to_task_postgres(row: &sqlx::postgres::PgRow) -> SchedulerResult<TaskRecord> {
        let task_args: Json<Vec<Value>> = row.try_get("task_args")?;
        let task_kwargs: Json<Map<String, Value>> = row.try_get("task_kwargs")?;
        let extra: Json<Map<String, Value>> = row.try_get("extra")?;

        Ok(TaskRecord {
            id: row.try_get("id")?,
            trace_id: row.try_get("trace_id")?,
            task_name: row.try_get("task_name")?,
            task_attr: row.try_get("task_attr")?,
            task_args: task_args.0,
            task_kwargs: task_kwargs.0,
            extra: extra.0,
            run_at: row.try_get("run_at")?,
            status: row.try_get::<TaskStatus, _>("status")?,
            version: row.try_get("version")?,
            remark: row.try_get("remark")?,
            exc_info: row.try_get("exc_info")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sqlite_timestamp_is_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let text = MappingHelpers::sqlite_timestamp(whole);
        assert_eq!(text, "2024-05-01T08:00:00.000000Z");

        let later = whole + chrono::Duration::microseconds(1500);
        assert!(MappingHelpers::sqlite_timestamp(later) > text);
    }
}
