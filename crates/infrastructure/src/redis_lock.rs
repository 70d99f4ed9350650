//! 基于 Redis 的租约锁
//!
//! `SET key token NX PX lease` 抢锁，持有期间后台任务按固定间隔续约，
//! 释放时用 Lua 脚本比较 token 后删除，不会误删他人的锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crontask_config::LockConfig;
use crontask_domain::{DistributedLock, LockLease};
use crontask_errors::{SchedulerError, SchedulerResult};
use redis::aio::ConnectionManager;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: ConnectionManager,
    config: LockConfig,
    renewals: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl RedisLock {
    pub async fn new(config: LockConfig) -> SchedulerResult<Self> {
        let client = redis::Client::open(config.redis_url.clone())
            .map_err(|e| SchedulerError::Lock(e.to_string()))?;

        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| SchedulerError::Lock(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SchedulerError::Lock(e.to_string()))?;

        info!("Redis 分布式锁连接成功: {}", config.redis_url);

        Ok(Self {
            conn,
            config,
            renewals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn build_key(&self, name: &str) -> String {
        build_lock_key(&self.config.key_prefix, name)
    }

    fn lease(&self) -> Duration {
        Duration::from_secs(self.config.effective_lease_seconds())
    }

    /// 抢锁直到成功，或在给定时间内未抢到时返回 `Timeout`
    pub async fn acquire_with_timeout(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> SchedulerResult<LockLease> {
        let key = self.build_key(name);
        let token = Uuid::new_v4().simple().to_string();
        let lease = self.lease();
        let lease_ms = lease.as_millis() as u64;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut conn = self.conn.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| SchedulerError::Lock(format!("获取锁 {key} 失败: {e}")))?;

            if acquired.is_some() {
                break;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(SchedulerError::Timeout(format!("获取锁 {key} 超时")));
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
        }

        debug!("获取锁成功: {}", key);
        self.start_renewal(key, token.clone(), lease_ms).await;

        Ok(LockLease {
            name: name.to_string(),
            token,
            lease,
            acquired_at: Utc::now(),
        })
    }

    async fn start_renewal(&self, key: String, token: String, lease_ms: u64) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.renewals.lock().await.insert(token.clone(), stop_tx);

        let mut conn = self.conn.clone();
        let interval = Duration::from_millis(self.config.renew_interval_ms);
        let renewals = Arc::clone(&self.renewals);

        tokio::spawn(async move {
            let script = redis::Script::new(RENEW_SCRIPT);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let renewed: Result<i64, _> = script
                    .key(&key)
                    .arg(&token)
                    .arg(lease_ms)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        warn!("锁租约已丢失，停止续约: {}", key);
                        break;
                    }
                    Err(e) => {
                        warn!("锁续约失败，停止续约: {}, error={}", key, e);
                        break;
                    }
                }
            }
            renewals.lock().await.remove(&token);
        });
    }
}

pub fn build_lock_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, name: &str) -> SchedulerResult<LockLease> {
        self.acquire_with_timeout(name, None).await
    }

    async fn release(&self, lease: LockLease) -> SchedulerResult<bool> {
        if let Some(stop) = self.renewals.lock().await.remove(&lease.token) {
            let _ = stop.send(());
        }

        let key = self.build_key(&lease.name);
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SchedulerError::Lock(format!("释放锁 {key} 失败: {e}")))?;

        if deleted == 1 {
            debug!("释放锁成功: {}", key);
        } else {
            warn!("释放锁时租约已失效: {}", key);
        }
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_lock_key() {
        assert_eq!(
            build_lock_key("crontask:lock:", "report:daily"),
            "crontask:lock:report:daily"
        );
    }
}
