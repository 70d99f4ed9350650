//! 外部协作者接口
//!
//! 消息分发与分布式锁不参与调度器自身的正确性，这里只定义边界。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crontask_errors::SchedulerResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息优先级，取值范围 1-10
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOWER: Priority = Priority(1);
    pub const MIDDLE: Priority = Priority(2);
    pub const HIGHER: Priority = Priority(3);
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Self {
        Priority(value.clamp(1, Self::MAX))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// 即发即弃的函数调用消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// `<module>:<function>`
    pub handler: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl DispatchMessage {
    pub fn new<S: Into<String>>(handler: S, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            handler: handler.into(),
            args,
            kwargs,
        }
    }
}

/// 尽力而为、至多一次投递，对任务引擎的状态机不可见
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        message: &DispatchMessage,
        priority: Option<Priority>,
    ) -> SchedulerResult<()>;

    /// 关闭底层连接，进程退出前调用
    async fn close(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 已获取的锁租约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub token: String,
    pub lease: Duration,
    pub acquired_at: DateTime<Utc>,
}

/// 带租约续期的分布式互斥锁，供任务处理器自行保证幂等
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, name: &str) -> SchedulerResult<LockLease>;

    /// 返回 false 表示租约已丢失（过期或被他人持有）
    async fn release(&self, lease: LockLease) -> SchedulerResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_is_clamped() {
        assert_eq!(Priority::new(0).value(), 1);
        assert_eq!(Priority::new(42).value(), Priority::MAX);
        assert!(Priority::HIGHER > Priority::LOWER);
    }

    #[test]
    fn test_dispatch_message_serialization() {
        let mut kwargs = Map::new();
        kwargs.insert("user_id".to_string(), json!(42));
        let message = DispatchMessage::new("jobs.notify:push", vec![json!("hello")], kwargs);

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["handler"], "jobs.notify:push");
        assert_eq!(value["args"][0], "hello");
        assert_eq!(value["kwargs"]["user_id"], 42);
    }
}
