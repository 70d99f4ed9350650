use std::collections::HashMap;
use std::sync::Arc;

use crontask_domain::TaskName;
use crontask_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::handler::TaskHandler;

pub type HandlerFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn TaskHandler>> + Send + Sync>;

/// 任务名称到处理器的注册表
///
/// 处理器可以直接注册，也可以注册为工厂：工厂在第一次被查找时构建处理器，
/// 结果缓存到进程结束。
pub struct TaskRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
    factories: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register<S: Into<String>>(
        &self,
        task_name: S,
        handler: Arc<dyn TaskHandler>,
    ) -> SchedulerResult<()> {
        let task_name = task_name.into();
        TaskName::parse(&task_name)?;
        self.handlers.write().await.insert(task_name.clone(), handler);
        info!("注册任务处理器: {}", task_name);
        Ok(())
    }

    pub async fn register_factory<S, F>(&self, task_name: S, factory: F) -> SchedulerResult<()>
    where
        S: Into<String>,
        F: Fn() -> anyhow::Result<Arc<dyn TaskHandler>> + Send + Sync + 'static,
    {
        let task_name = task_name.into();
        TaskName::parse(&task_name)?;
        self.factories
            .write()
            .await
            .insert(task_name.clone(), Box::new(factory));
        info!("注册任务处理器工厂: {}", task_name);
        Ok(())
    }

    /// 查找处理器，未注册时返回 `HandlerNotFound`
    pub async fn resolve(&self, task_name: &str) -> SchedulerResult<Arc<dyn TaskHandler>> {
        if let Some(handler) = self.handlers.read().await.get(task_name) {
            return Ok(Arc::clone(handler));
        }

        let factories = self.factories.read().await;
        let factory = factories
            .get(task_name)
            .ok_or_else(|| SchedulerError::handler_not_found(task_name))?;

        let mut handlers = self.handlers.write().await;
        if let Some(handler) = handlers.get(task_name) {
            return Ok(Arc::clone(handler));
        }

        let handler = factory().map_err(|e| {
            SchedulerError::handler_not_found(format!("{task_name}: 构建处理器失败: {e:#}"))
        })?;
        handlers.insert(task_name.to_string(), Arc::clone(&handler));
        debug!("处理器已构建并缓存: {}", task_name);
        Ok(handler)
    }

    pub async fn contains(&self, task_name: &str) -> bool {
        self.handlers.read().await.contains_key(task_name)
            || self.factories.read().await.contains_key(task_name)
    }

    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        for name in self.factories.read().await.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
