pub mod app;
pub mod cli;
pub mod handlers;
pub mod telemetry;

pub use app::{AppMode, Application};
