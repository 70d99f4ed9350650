pub mod entities;
pub mod execution;
pub mod ports;
pub mod repositories;
pub mod services;

pub use crontask_errors::{SchedulerError, SchedulerResult};
pub use entities::*;
pub use execution::*;
pub use ports::*;
pub use repositories::*;
pub use services::*;
