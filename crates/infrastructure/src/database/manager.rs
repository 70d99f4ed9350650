use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crontask_config::DatabaseConfig;
use crontask_domain::TaskEngine;
use crontask_errors::SchedulerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use super::postgres::PostgresTaskEngine;
use super::sqlite::SqliteTaskEngine;

/// Database type detection
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// 内存库的每个连接都是独立的数据库，只能使用单连接
fn is_sqlite_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                    .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
                    .connect(&config.url)
                    .await?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let connect_options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

                let options = if is_sqlite_memory(&config.url) {
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    SqlitePoolOptions::new()
                        .max_connections(config.max_connections)
                        .min_connections(config.min_connections)
                        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                };

                let pool = options
                    .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                    .connect_with(connect_options)
                    .await?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        match self {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// Unified database manager
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    /// 建立连接池，`auto_migrate` 开启时同时创建任务表
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = DatabasePool::new(config).await?;
        let manager = Self { pool };
        info!("数据库连接成功: {:?}", manager.database_type());

        if config.auto_migrate {
            manager.migrate().await?;
        }
        Ok(manager)
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => PostgresTaskEngine::run_migrations(pool).await,
            DatabasePool::SQLite(pool) => SqliteTaskEngine::run_migrations(pool).await,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        self.pool.health_check().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    /// Factory method for the task engine
    pub fn task_engine(&self) -> Arc<dyn TaskEngine> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresTaskEngine::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteTaskEngine::new(pool.clone())),
        }
    }
}
