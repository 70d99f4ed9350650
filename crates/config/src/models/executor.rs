use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 执行器线程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    /// 单次认领的最大任务数
    pub batch_size: u32,
    /// 没有可执行任务时的休眠间隔
    pub idle_interval_ms: u64,
    /// 每个 worker 依次错开启动的间隔
    pub startup_stagger_ms: u64,
    /// worker 名称前缀，默认使用主机名
    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 20,
            idle_interval_ms: 2000,
            startup_stagger_ms: 200,
            name_prefix: None,
        }
    }
}

impl ConfigValidator for ExecutorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.worker_count, "executor.worker_count")?;
        ValidationUtils::validate_count(self.batch_size as usize, "executor.batch_size")?;
        ValidationUtils::validate_interval_ms(
            self.idle_interval_ms,
            10,
            600_000,
            "executor.idle_interval_ms",
        )?;
        if self.startup_stagger_ms > 60_000 {
            return Err(crate::ConfigError::Validation(
                "executor.startup_stagger_ms must be less than or equal to 60000".to_string(),
            ));
        }
        if let Some(prefix) = &self.name_prefix {
            ValidationUtils::validate_not_empty(prefix, "executor.name_prefix")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.idle_interval_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_executor_config_validation() {
        let mut config = ExecutorConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = ExecutorConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExecutorConfig::default();
        config.idle_interval_ms = 1;
        assert!(config.validate().is_err());

        let mut config = ExecutorConfig::default();
        config.name_prefix = Some(" ".to_string());
        assert!(config.validate().is_err());
    }
}
