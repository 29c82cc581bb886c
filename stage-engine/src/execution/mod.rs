// Execution Engine Module
// Staged task scheduling, the worker pool, background sidecars and remote dispatch

pub mod background;
pub mod logs;
pub mod pool;
pub mod remote;
pub mod scheduler;
pub mod stage;
pub mod task;

// Re-export key types
pub use background::BackgroundRunner;
pub use logs::{find_error, merge_into_job_log};
pub use pool::WorkerPool;
pub use remote::RemoteDispatcher;
pub use scheduler::{Scheduler, TaskExecutor};
pub use stage::Stage;
pub use task::{Resources, ShellTask, Task};
