use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crontask_domain::{
    normalize_timestamp, NewTask, TaskEngine, TaskFilter, TaskIdentity, TaskRecord, TaskStatus,
    TaskUpdate,
};
use crontask_errors::SchedulerResult;
use metrics::counter;
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    database::mapping::{MappingHelpers, TASK_COLUMNS},
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    task_context,
};

pub struct PostgresTaskEngine {
    pool: PgPool,
}

impl PostgresTaskEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(pool: &PgPool) -> SchedulerResult<()> {
        debug!("Running PostgreSQL database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS crontask_task (
                id BIGSERIAL PRIMARY KEY,
                trace_id UUID NOT NULL,
                task_name VARCHAR(255) NOT NULL,
                task_attr VARCHAR(255) NOT NULL,
                task_args JSONB NOT NULL DEFAULT '[]'::jsonb,
                task_kwargs JSONB NOT NULL DEFAULT '{}'::jsonb,
                extra JSONB NOT NULL DEFAULT '{}'::jsonb,
                run_at TIMESTAMPTZ NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'waiting',
                version BIGINT NOT NULL DEFAULT 0,
                remark TEXT,
                exc_info TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT uq_crontask_task_ident UNIQUE (task_name, task_attr)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_crontask_task_run_at ON crontask_task(run_at)",
            "CREATE INDEX IF NOT EXISTS idx_crontask_task_status ON crontask_task(status)",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;
        }

        debug!("Successfully completed PostgreSQL database migrations");
        Ok(())
    }
}

#[async_trait]
impl TaskEngine for PostgresTaskEngine {
    #[instrument(skip(self, task), fields(task_name = %task.task_name, task_attr = %task.task_attr))]
    async fn create(&self, task: &NewTask) -> SchedulerResult<TaskRecord> {
        let identity = task.identity();
        let context = task_context!(RepositoryOperation::Create, identity = &identity);
        let run_at = task.validate()?;
        let now = normalize_timestamp(Utc::now());

        let sql = format!(
            "INSERT INTO crontask_task \
             (trace_id, task_name, task_attr, task_args, task_kwargs, extra, run_at, status, version, remark, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $10) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&task.task_name)
            .bind(&task.task_attr)
            .bind(Json(&task.task_args))
            .bind(Json(&task.task_kwargs))
            .bind(Json(&task.extra))
            .bind(run_at)
            .bind(TaskStatus::Waiting)
            .bind(&task.remark)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        MappingHelpers::row_to_task_postgres(&row)
    }

    #[instrument(skip(self, changes), fields(task = %identity))]
    async fn update(&self, identity: &TaskIdentity, changes: &TaskUpdate) -> SchedulerResult<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let context = task_context!(RepositoryOperation::Update, identity = identity);

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE crontask_task SET version = version + 1, updated_at = ");
        builder.push_bind(normalize_timestamp(Utc::now()));

        if let Some(run_at) = changes.run_at {
            builder.push(", run_at = ").push_bind(normalize_timestamp(run_at));
        }
        if let Some(args) = &changes.task_args {
            builder.push(", task_args = ").push_bind(Json(args.clone()));
        }
        if let Some(kwargs) = &changes.task_kwargs {
            builder.push(", task_kwargs = ").push_bind(Json(kwargs.clone()));
        }
        if let Some(extra) = &changes.extra {
            builder.push(", extra = ").push_bind(Json(extra.clone()));
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
        let result =
            sqlx::query("DELETE FROM crontask_task WHERE task_name = $1 AND task_attr = $2")
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

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM crontask_task \
             WHERE status = $1 AND run_at <= $2 \
             ORDER BY run_at, id LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(TaskStatus::Waiting)
            .bind(normalize_timestamp(Utc::now()))
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = MappingHelpers::row_to_task_postgres(&row)?;
            let claimed_at = normalize_timestamp(Utc::now());

            let result = sqlx::query(
                "UPDATE crontask_task SET status = $1, version = version + 1, updated_at = $2 \
                 WHERE id = $3 AND status = $4 AND version = $5",
            )
            .bind(TaskStatus::Pending)
            .bind(claimed_at)
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
            "UPDATE crontask_task SET status = $1, version = version + 1, updated_at = $2 \
             WHERE id = $3 AND task_name = $4 AND task_attr = $5 AND status = $6",
        )
        .bind(TaskStatus::Running)
        .bind(normalize_timestamp(Utc::now()))
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
             WHERE id = $1 AND task_name = $2 AND task_attr = $3 AND status = $4",
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
            "UPDATE crontask_task SET status = $1, exc_info = $2, version = version + 1, updated_at = $3 \
             WHERE id = $4",
        )
        .bind(TaskStatus::Failed)
        .bind(exc_info)
        .bind(normalize_timestamp(Utc::now()))
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
            "UPDATE crontask_task SET status = $1, run_at = $2, version = version + 1, updated_at = $3 \
             WHERE id = $4 AND status = $5",
        )
        .bind(TaskStatus::Waiting)
        .bind(normalize_timestamp(next_run_at))
        .bind(normalize_timestamp(Utc::now()))
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
            "SELECT {TASK_COLUMNS} FROM crontask_task WHERE task_name = $1 AND task_attr = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&identity.task_name)
            .bind(&identity.task_attr)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        row.as_ref().map(MappingHelpers::row_to_task_postgres).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        let context = task_context!(RepositoryOperation::Query);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM crontask_task WHERE 1 = 1"
        ));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(task_name) = &filter.task_name {
            builder.push(" AND task_name = ").push_bind(task_name.clone());
        }

        builder.push(" ORDER BY run_at, id");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ").push_bind(offset);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        rows.iter().map(MappingHelpers::row_to_task_postgres).collect()
    }
}
