// Task Contract
// The unit of work the scheduler runs: validate, prepare, execute, clean up

use crate::error::{EngineError, EngineResult};

use std::path::{Path, PathBuf};

/// Resource hints a task declares about its command.
///
/// The engine does not enforce them. They weight scheduling decisions only:
/// single-process tasks are eligible for remote dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    /// Processes the command starts
    pub processes: u32,
    /// Threads per process
    pub threads: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            processes: 1,
            threads: 1,
        }
    }
}

/// A single external command plus its lifecycle hooks.
///
/// The scheduler drives every task through `check` (once, before the stage is
/// dispatched), `setup` (on a pool worker; must leave `command` populated),
/// execution of `command` with output captured to the task log, and
/// `teardown`, which runs whatever the exit status was.
#[async_trait::async_trait]
pub trait Task: Send + Sync {
    /// Short label used in log events
    fn name(&self) -> &str {
        "task"
    }

    /// Pre-flight validation. An error aborts the whole stage before dispatch.
    fn check(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Prepare the command. May block, e.g. waiting on a broker slot.
    async fn setup(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// The shell command to execute; only meaningful after `setup`
    fn command(&self) -> &str;

    /// Cleanup, run after execution regardless of outcome
    async fn teardown(&mut self) {}

    fn resources(&self) -> Resources {
        Resources::default()
    }

    /// Receives the path the engine captures this task's output into
    fn set_log_path(&mut self, _path: &Path) {}
}

/// A task that runs a fixed shell command
#[derive(Debug, Clone)]
pub struct ShellTask {
    name: String,
    command: String,
    resources: Resources,
    log_path: Option<PathBuf>,
}

impl ShellTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: "shell".to_string(),
            command: command.into(),
            resources: Resources::default(),
            log_path: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resources(mut self, processes: u32, threads: u32) -> Self {
        self.resources = Resources { processes, threads };
        self
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

#[async_trait::async_trait]
impl Task for ShellTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> EngineResult<()> {
        if self.command.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "task '{}' has an empty command",
                self.name
            )));
        }
        Ok(())
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn resources(&self) -> Resources {
        self.resources
    }

    fn set_log_path(&mut self, path: &Path) {
        self.log_path = Some(path.to_path_buf());
    }
}
