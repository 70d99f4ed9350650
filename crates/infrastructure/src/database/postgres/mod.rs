pub mod postgres_task_engine;

pub use postgres_task_engine::PostgresTaskEngine;
