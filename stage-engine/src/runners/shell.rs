// Shell Runner
// Executes task commands through a shell, capturing output to log files

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// Exit status recorded when the shell itself could not be started
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Shell every command is handed to with `-c`
const SHELL: &str = "sh";

/// Configuration for shell execution
#[derive(Debug, Clone, Default)]
pub struct ShellConfig {
    /// Working directory for the command (inherits the caller's when unset)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

/// Output collected from a captured run
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (signals are folded in as 128 + signal)
    pub exit_code: i32,
}

/// Shell runner for executing commands
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command with stdout and stderr written to `log`.
    ///
    /// The log is truncated first. Returns the exit status; failures to start
    /// the shell are written into the log and reported as
    /// [`SPAWN_FAILURE_STATUS`].
    pub async fn run_logged(&self, script: &str, log: &Path, config: &ShellConfig) -> i32 {
        self.run_redirected(script, Stdio::null(), log, config).await
    }

    /// Like [`run_logged`](Self::run_logged), with stdin read from `input`
    pub async fn run_logged_with_input(
        &self,
        script: &str,
        input: &Path,
        log: &Path,
        config: &ShellConfig,
    ) -> i32 {
        let stdin = match File::open(input) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                append_to_log(log, &format!("cannot open input {}: {}", input.display(), e));
                return SPAWN_FAILURE_STATUS;
            }
        };
        self.run_redirected(script, stdin, log, config).await
    }

    async fn run_redirected(
        &self,
        script: &str,
        stdin: Stdio,
        log: &Path,
        config: &ShellConfig,
    ) -> i32 {
        let stdout = match File::create(log) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(log = %log.display(), error = %e, "cannot create task log");
                return SPAWN_FAILURE_STATUS;
            }
        };
        let stderr = match stdout.try_clone() {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(log = %log.display(), error = %e, "cannot share task log handle");
                return SPAWN_FAILURE_STATUS;
            }
        };

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(script);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&config.env);
        cmd.stdin(stdin);
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                append_to_log(
                    log,
                    &format!("Failed to spawn shell process '{}': {}", SHELL, e),
                );
                return SPAWN_FAILURE_STATUS;
            }
        };

        match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                append_to_log(log, &format!("Failed to wait for shell process: {}", e));
                SPAWN_FAILURE_STATUS
            }
        }
    }

    /// Run a command and collect its output in memory
    pub async fn run_script(&self, script: &str, config: &ShellConfig) -> ShellOutput {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(script);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&config.env);
        cmd.stdin(Stdio::null());

        match cmd.output().await {
            Ok(output) => ShellOutput {
                stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
                exit_code: exit_code(output.status),
            },
            Err(e) => ShellOutput {
                stdout: String::new(),
                stderr: format!("Failed to spawn shell process '{}': {}", SHELL, e),
                exit_code: SPAWN_FAILURE_STATUS,
            },
        }
    }
}

/// Fold a process exit status into a single integer, shell style
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| 128 + s).unwrap_or(1),
    }
}

/// Quote a string as one POSIX shell word
pub fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

fn append_to_log(log: &Path, message: &str) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .and_then(|mut file| writeln!(file, "{}", message));
    if let Err(e) = written {
        tracing::warn!(log = %log.display(), error = %e, "{}", message);
    }
}
