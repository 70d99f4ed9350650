pub mod executor;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod shutdown;

pub use executor::{TaskDisposition, TaskExecutor};
pub use handler::{handler_fn, FnHandler, TaskHandler};
pub use pool::ExecutorPool;
pub use registry::{HandlerFactory, TaskRegistry};
pub use shutdown::ShutdownManager;
