pub mod sqlite_task_engine;

pub use sqlite_task_engine::SqliteTaskEngine;
