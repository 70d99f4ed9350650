use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 租约最短时间（秒）
pub const MIN_LEASE_SECONDS: u64 = 3;

/// Redis 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub lease_seconds: u64,
    /// 持有期间的续约间隔
    pub renew_interval_ms: u64,
    /// 抢锁失败后的重试间隔
    pub retry_interval_ms: u64,
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://localhost:6379".to_string(),
            lease_seconds: MIN_LEASE_SECONDS,
            renew_interval_ms: 1000,
            retry_interval_ms: 100,
            key_prefix: "crontask:lock:".to_string(),
        }
    }
}

impl LockConfig {
    /// 配置的租约时间，不足下限时按下限处理
    pub fn effective_lease_seconds(&self) -> u64 {
        self.lease_seconds.max(MIN_LEASE_SECONDS)
    }
}

impl ConfigValidator for LockConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_url_scheme(
            &self.redis_url,
            &["redis://", "rediss://"],
            "lock.redis_url",
        )?;
        ValidationUtils::validate_not_empty(&self.key_prefix, "lock.key_prefix")?;
        ValidationUtils::validate_interval_ms(self.retry_interval_ms, 10, 60_000, "lock.retry_interval_ms")?;

        let lease_ms = self.effective_lease_seconds() * 1000;
        if self.renew_interval_ms == 0 || self.renew_interval_ms >= lease_ms {
            return Err(crate::ConfigError::Validation(
                "lock.renew_interval_ms must be greater than 0 and shorter than the lease"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_has_floor() {
        let config = LockConfig {
            lease_seconds: 1,
            ..LockConfig::default()
        };
        assert_eq!(config.effective_lease_seconds(), MIN_LEASE_SECONDS);

        let config = LockConfig {
            lease_seconds: 30,
            ..LockConfig::default()
        };
        assert_eq!(config.effective_lease_seconds(), 30);
    }

    #[test]
    fn test_lock_config_validation() {
        let mut config = LockConfig {
            enabled: true,
            ..LockConfig::default()
        };
        assert!(config.validate().is_ok());

        config.renew_interval_ms = 3000;
        assert!(config.validate().is_err());

        config.renew_interval_ms = 1000;
        config.redis_url = "amqp://localhost".to_string();
        assert!(config.validate().is_err());
    }
}
