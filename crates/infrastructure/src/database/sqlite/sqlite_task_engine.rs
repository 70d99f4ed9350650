use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crontask_domain::{
    normalize_timestamp, NewTask, TaskEngine, TaskFilter, TaskIdentity, TaskRecord, TaskStatus,
    TaskUpdate,
};
use crontask_errors::SchedulerResult;
use metrics::counter;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    database::mapping::{MappingHelpers, TASK_COLUMNS},
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    task_context,
};

pub struct SqliteTaskEngine {
    pool: SqlitePool,
}

impl SqliteTaskEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建任务表和索引
    pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crontask_task (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                task_attr TEXT NOT NULL,
                task_args TEXT NOT NULL DEFAULT '[]',
                task_kwargs TEXT NOT NULL DEFAULT '{}',
                extra TEXT NOT NULL DEFAULT '{}',
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                version INTEGER NOT NULL DEFAULT 0,
                remark TEXT,
                exc_info TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CONSTRAINT uq_crontask_task_ident UNIQUE (task_name, task_attr)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_crontask_task_run_at ON crontask_task(run_at)",
            "CREATE INDEX IF NOT EXISTS idx_crontask_task_status ON crontask_task(status)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;
        }

        debug!("Successfully completed SQLite database migrations");
        Ok(())
    }
}

#[async_trait]
impl TaskEngine for SqliteTaskEngine {
    #[instrument(skip(self, task), fields(task_name = %task.task_name, task_attr = %task.task_attr))]
    async fn create(&self, task: &NewTask) -> SchedulerResult<TaskRecord> {
        let identity = task.identity();
        let context = task_context!(RepositoryOperation::Create, identity = &identity);
        let run_at = task.validate()?;
        let now = normalize_timestamp(Utc::now());

        let args_json = serde_json::to_string(&task.task_args)
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
        let kwargs_json = serde_json::to_string(&task.task_kwargs)
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
        let extra_json = serde_json::to_string(&task.extra)
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;

        let sql = format!(
            "INSERT INTO crontask_task \
             (trace_id, task_name, task_attr, task_args, task_kwargs, extra, run_at, status, version, remark, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&task.task_name)
            .bind(&task.task_attr)
            .bind(args_json)
            .bind(kwargs_json)
            .bind(extra_json)
            .bind(MappingHelpers::sqlite_timestamp(run_at))
            .bind(TaskStatus::Waiting)
            .bind(&task.remark)
            .bind(MappingHelpers::sqlite_timestamp(now))
            .bind(MappingHelpers::sqlite_timestamp(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        MappingHelpers::row_to_task_sqlite(&row)
    }

    #[instrument(skip(self, changes), fields(task = %identity))]
    async fn update(&self, identity: &TaskIdentity, changes: &TaskUpdate) -> SchedulerResult<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let context = task_context!(RepositoryOperation::Update, identity = identity);
        let now = normalize_timestamp(Utc::now());

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE crontask_task SET version = version + 1, updated_at = ");
        builder.push_bind(MappingHelpers::sqlite_timestamp(now));

        if let Some(run_at) = changes.run_at {
            builder
                .push(", run_at = ")
                .push_bind(MappingHelpers::sqlite_timestamp(normalize_timestamp(run_at)));
        }
        if let Some(args) = &changes.task_args {
            let json = serde_json::to_string(args)
                .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
            builder.push(", task_args = ").push_bind(json);
        }
        if let Some(kwargs) = &changes.task_kwargs {
            let json = serde_json::to_string(kwargs)
                .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
            builder.push(", task_kwargs = ").push_bind(json);
        }
        if let Some(extra) = &changes.extra {
            let json = serde_json::to_string(extra)
                .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
            builder.push(", extra = ").push_bind(json);
        }
        if let Some(remark) = &changes.remark {
            builder.push(", remark = ").push_bind(remark.clone());
        }

        builder
            .push(" WHERE task_name = ")
            .push_bind(identity.task_name.clone())
            .push(" AND task_attr = ")
            .push_bind(identity.task_attr.clone())
            .push(" AND status = ")
            .push_bind(TaskStatus::Waiting);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(task = %identity))]
    async fn cancel(&self, identity: &TaskIdentity) -> SchedulerResult<(bool, u64)> {
        let context = task_context!(RepositoryOperation::Delete, identity = identity);
        let result = sqlx::query("DELETE FROM crontask_task WHERE task_name = ? AND task_attr = ?")
            .bind(&identity.task_name)
            .bind(&identity.task_attr)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        let deleted = result.rows_affected();
        Ok((deleted > 0, deleted))
    }

    #[instrument(skip(self))]
    async fn claim_batch(&self, batch_size: u32) -> SchedulerResult<Vec<TaskRecord>> {
        let context = task_context!(RepositoryOperation::Claim);
        let now = normalize_timestamp(Utc::now());

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM crontask_task \
             WHERE status = ? AND run_at <= ? \
             ORDER BY run_at, id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(TaskStatus::Waiting)
            .bind(MappingHelpers::sqlite_timestamp(now))
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = MappingHelpers::row_to_task_sqlite(&row)?;
            let claimed_at = normalize_timestamp(Utc::now());

            let result = sqlx::query(
                "UPDATE crontask_task SET status = ?, version = version + 1, updated_at = ? \
                 WHERE id = ? AND status = ? AND version = ?",
            )
            .bind(TaskStatus::Pending)
            .bind(MappingHelpers::sqlite_timestamp(claimed_at))
            .bind(record.id)
            .bind(TaskStatus::Waiting)
            .bind(record.version)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::task_database_error(
                    context.clone().with_task_id(record.id),
                    e,
                )
            })?;

            if result.rows_affected() == 1 {
                record.status = TaskStatus::Pending;
                record.version += 1;
                record.updated_at = claimed_at;
                claimed.push(record);
            } else {
                counter!("crontask_claim_conflicts_total").increment(1);
                debug!("任务已被其他执行器认领: {}", record.entity_description());
            }
        }

        Ok(claimed)
    }

    #[instrument(skip(self), fields(task = %identity))]
    async fn begin_run(&self, task_id: i64, identity: &TaskIdentity) -> SchedulerResult<u64> {
        let context =
            task_context!(RepositoryOperation::Transition, identity = identity).with_task_id(task_id);
        let result = sqlx::query(
            "UPDATE crontask_task SET status = ?, version = version + 1, updated_at = ? \
             WHERE id = ? AND task_name = ? AND task_attr = ? AND status = ?",
        )
        .bind(TaskStatus::Running)
        .bind(MappingHelpers::sqlite_timestamp(normalize_timestamp(Utc::now())))
        .bind(task_id)
        .bind(&identity.task_name)
        .bind(&identity.task_attr)
        .bind(TaskStatus::Pending)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(task = %identity))]
    async fn complete(&self, task_id: i64, identity: &TaskIdentity) -> SchedulerResult<u64> {
        let context =
            task_context!(RepositoryOperation::Delete, identity = identity).with_task_id(task_id);
        let result = sqlx::query(
            "DELETE FROM crontask_task \
             WHERE id = ? AND task_name = ? AND task_attr = ? AND status = ?",
        )
        .bind(task_id)
        .bind(&identity.task_name)
        .bind(&identity.task_attr)
        .bind(TaskStatus::Running)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, exc_info))]
    async fn fail(&self, task_id: i64, exc_info: &str) -> SchedulerResult<u64> {
        let context = task_context!(RepositoryOperation::Transition, task_id = task_id);
        let result = sqlx::query(
            "UPDATE crontask_task SET status = ?, exc_info = ?, version = version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(TaskStatus::Failed)
        .bind(exc_info)
        .bind(MappingHelpers::sqlite_timestamp(normalize_timestamp(Utc::now())))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reschedule(&self, task_id: i64, next_run_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let context = task_context!(RepositoryOperation::Transition, task_id = task_id);
        let result = sqlx::query(
            "UPDATE crontask_task SET status = ?, run_at = ?, version = version + 1, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Waiting)
        .bind(MappingHelpers::sqlite_timestamp(normalize_timestamp(next_run_at)))
        .bind(MappingHelpers::sqlite_timestamp(normalize_timestamp(Utc::now())))
        .bind(task_id)
        .bind(TaskStatus::Running)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(task = %identity))]
    async fn find(&self, identity: &TaskIdentity) -> SchedulerResult<Option<TaskRecord>> {
        let context = task_context!(RepositoryOperation::Read, identity = identity);
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM crontask_task WHERE task_name = ? AND task_attr = ?"
        );
        let row = sqlx::query(&sql)
            .bind(&identity.task_name)
            .bind(&identity.task_attr)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        row.as_ref().map(MappingHelpers::row_to_task_sqlite).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        let context = task_context!(RepositoryOperation::Query);
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM crontask_task WHERE 1 = 1"
        ));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(task_name) = &filter.task_name {
            builder.push(" AND task_name = ").push_bind(task_name.clone());
        }

        builder.push(" ORDER BY run_at, id");

        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                builder.push(" LIMIT ").push_bind(limit);
                if let Some(offset) = offset {
                    builder.push(" OFFSET ").push_bind(offset);
                }
            }
            (None, Some(offset)) => {
                builder.push(" LIMIT -1 OFFSET ").push_bind(offset);
            }
            (None, None) => {}
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        rows.iter().map(MappingHelpers::row_to_task_sqlite).collect()
    }
}
