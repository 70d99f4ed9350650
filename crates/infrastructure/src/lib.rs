pub mod database;
pub mod error_handling;
pub mod message_queue;
pub mod redis_lock;

pub use database::{
    DatabaseManager, DatabasePool, DatabaseType, PostgresTaskEngine, SqliteTaskEngine,
};
pub use error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext};
pub use message_queue::RabbitMqPublisher;
pub use redis_lock::RedisLock;
