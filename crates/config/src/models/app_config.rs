use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig, executor::ExecutorConfig, lock::LockConfig,
    message_queue::MessageQueueConfig, observability::ObservabilityConfig,
};
use crate::validation::ConfigValidator;

/// 未显式指定配置文件时依次查找的位置
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/crontask.toml",
    "crontask.toml",
    "/etc/crontask/config.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub message_queue: MessageQueueConfig,
    pub lock: LockConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载顺序：内置默认值 < 配置文件 < `CRONTASK_*` 环境变量
    ///
    /// 环境变量使用 `__` 分隔层级，例如 `CRONTASK_EXECUTOR__WORKER_COUNT=8`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Self::with_defaults(ConfigBuilder::builder())?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("CRONTASK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = AppConfig::default();
        let builder = builder
            .set_default("database.url", defaults.database.url)?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("database.min_connections", defaults.database.min_connections)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds,
            )?
            .set_default(
                "database.idle_timeout_seconds",
                defaults.database.idle_timeout_seconds,
            )?
            .set_default("database.auto_migrate", defaults.database.auto_migrate)?
            .set_default("executor.worker_count", defaults.executor.worker_count as u64)?
            .set_default("executor.batch_size", defaults.executor.batch_size)?
            .set_default("executor.idle_interval_ms", defaults.executor.idle_interval_ms)?
            .set_default(
                "executor.startup_stagger_ms",
                defaults.executor.startup_stagger_ms,
            )?
            .set_default("message_queue.enabled", defaults.message_queue.enabled)?
            .set_default("message_queue.url", defaults.message_queue.url)?
            .set_default("message_queue.exchange", defaults.message_queue.exchange)?
            .set_default(
                "message_queue.max_priority",
                defaults.message_queue.max_priority as u64,
            )?
            .set_default(
                "message_queue.connection_timeout_seconds",
                defaults.message_queue.connection_timeout_seconds,
            )?
            .set_default("lock.enabled", defaults.lock.enabled)?
            .set_default("lock.redis_url", defaults.lock.redis_url)?
            .set_default("lock.lease_seconds", defaults.lock.lease_seconds)?
            .set_default("lock.renew_interval_ms", defaults.lock.renew_interval_ms)?
            .set_default("lock.retry_interval_ms", defaults.lock.retry_interval_ms)?
            .set_default("lock.key_prefix", defaults.lock.key_prefix)?
            .set_default("observability.log_level", defaults.observability.log_level)?
            .set_default("observability.log_format", "pretty")?
            .set_default(
                "observability.metrics_enabled",
                defaults.observability.metrics_enabled,
            )?
            .set_default(
                "observability.metrics_bind_address",
                defaults.observability.metrics_bind_address,
            )?;
        Ok(builder)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.executor.validate()?;
        self.message_queue.validate()?;
        self.lock.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogFormat;
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database.url, "sqlite://crontask.db");
        assert_eq!(config.executor.worker_count, 4);
        assert_eq!(config.executor.batch_size, 20);
        assert!(!config.message_queue.enabled);
        assert!(!config.lock.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_toml_roundtrip() {
        let config = AppConfig::default();
        let toml_str = config.to_toml().expect("Failed to serialize");
        let parsed = AppConfig::from_toml(&toml_str).expect("Failed to parse");
        assert_eq!(parsed.database.url, config.database.url);
        assert_eq!(parsed.executor.idle_interval_ms, config.executor.idle_interval_ms);
    }

    #[test]
    fn test_app_config_from_toml_rejects_invalid() {
        let mut config = AppConfig::default();
        config.executor.worker_count = 0;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(AppConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "sqlite::memory:"

[executor]
worker_count = 2
idle_interval_ms = 500

[observability]
log_format = "json"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.executor.worker_count, 2);
        assert_eq!(config.executor.idle_interval_ms, 500);
        assert_eq!(config.executor.batch_size, 20);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.lock.lease_seconds, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/crontask.toml")).is_err());
    }

    #[test]
    fn test_bundled_sample_config_is_valid() {
        let config = AppConfig::from_toml(include_str!("../../../../config/crontask.toml")).unwrap();
        assert_eq!(config.executor.startup_stagger_ms, 200);
        assert_eq!(config.lock.key_prefix, "crontask:lock:");
        assert_eq!(config.observability.metrics_bind_address, "0.0.0.0:9464");
    }
}
