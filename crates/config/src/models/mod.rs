pub mod app_config;
pub mod database;
pub mod executor;
pub mod lock;
pub mod message_queue;
pub mod observability;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use executor::ExecutorConfig;
pub use lock::LockConfig;
pub use message_queue::MessageQueueConfig;
pub use observability::{LogFormat, ObservabilityConfig};
