// Stage Engine Library
// Staged shell task scheduling, background sidecars and a host slot broker

pub mod broker;
pub mod config;
pub mod error;
pub mod execution;
pub mod runners;

// Re-export commonly used types
pub use config::{BrokerConfig, EngineConfig, RemoteConfig};
pub use error::{EngineError, EngineResult};

// Re-export execution types
pub use execution::{
    BackgroundRunner, Resources, Scheduler, ShellTask, Stage, Task, WorkerPool,
};

// Re-export broker types
pub use broker::{
    Broker, BrokerClient, BrokerEndpoint, BrokerError, ClientId, Grant, SlotSnapshot, SlotTable,
    SlotTask,
};

// Re-export runner types
pub use runners::{ShellConfig, ShellRunner};
