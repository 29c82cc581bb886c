// Runners Module
// Provides the shell runner that executes task commands

pub mod shell;

// Re-export key types
pub use shell::{exit_code, quote, ShellConfig, ShellOutput, ShellRunner, SPAWN_FAILURE_STATUS};
