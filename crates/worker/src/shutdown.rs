use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 每个 worker 持有一个克隆，在循环开头以及空闲休眠时观察关闭信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// 订阅关闭信号；关闭后订阅的接收器会立即看到 `true`
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭，可重复调用
    pub fn shutdown(&self) {
        let triggered = self.shutdown_tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });

        if triggered {
            info!(
                "关闭信号已发送给 {} 个订阅者",
                self.shutdown_tx.receiver_count()
            );
        } else {
            debug!("关闭管理器已经触发过关闭");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_manager_basic() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());

        let mut rx = manager.subscribe();
        manager.shutdown();
        assert!(manager.is_shutdown());

        let result = timeout(Duration::from_millis(100), rx.changed()).await;
        assert!(result.is_ok());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let manager = ShutdownManager::new();
        let cloned = manager.clone();
        manager.shutdown();

        let rx = cloned.subscribe();
        assert!(*rx.borrow());

        let result = timeout(Duration::from_millis(100), cloned.wait_for_shutdown()).await;
        assert!(result.is_ok());
    }
}
