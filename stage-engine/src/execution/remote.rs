// Remote Dispatch
// Runs single-process tasks on a host list over ssh, tracking remote pids

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::runners::{quote, ShellConfig, ShellRunner};

use std::fs;
use std::path::{Path, PathBuf};

/// Sends task commands to remote hosts, round-robin by job number.
///
/// Each dispatched job gets a generated script under `<temp_dir>/executor`
/// that starts the command in the background, records the remote pid next
/// to the script, waits for it and removes the pid file. A pid file that is
/// still present therefore names a job that has not finished.
#[derive(Debug)]
pub struct RemoteDispatcher {
    hosts: Vec<String>,
    shell: String,
    ssh: String,
    script_dir: PathBuf,
    runner: ShellRunner,
}

impl RemoteDispatcher {
    /// Build a dispatcher when the configuration asks for remote dispatch
    pub fn from_config(config: &EngineConfig) -> EngineResult<Option<Self>> {
        if !config.remote.is_active() {
            return Ok(None);
        }
        let ssh = &config.remote.ssh;
        which::which(ssh).map_err(|e| {
            EngineError::Config(format!("remote dispatch needs {} on PATH: {}", ssh, e))
        })?;

        Ok(Some(Self {
            hosts: config.remote.hosts.clone(),
            shell: config.remote.shell.clone(),
            ssh: ssh.clone(),
            script_dir: config.temp_dir.join("executor"),
            runner: ShellRunner::new(),
        }))
    }

    pub fn host_for(&self, job_id: usize) -> &str {
        &self.hosts[job_id % self.hosts.len()]
    }

    pub fn script_path(&self, job_id: usize) -> PathBuf {
        self.script_dir.join(format!("job-{}.sh", job_id))
    }

    pub fn pid_path(&self, job_id: usize) -> PathBuf {
        self.script_dir.join(format!("job-{}.sh.pid", job_id))
    }

    /// Wrapper script recording the remote pid of `command`.
    ///
    /// The command runs in a subshell so a command list is logged, tracked
    /// and waited on as one job.
    pub fn render_script(command: &str, log: &Path, pid_file: &Path) -> String {
        let pid_file = quote(&pid_file.to_string_lossy());
        format!(
            "( {command} ) >> {log} 2>&1 &\n\
             pid=$!\n\
             echo $pid > {pid_file}\n\
             wait \"$pid\"\n\
             ret=$?\n\
             rm -f {pid_file}\n\
             exit $ret\n",
            command = command,
            log = quote(&log.to_string_lossy()),
            pid_file = pid_file,
        )
    }

    /// Command that feeds a script on stdin to a shell on `host`
    pub fn ssh_command(&self, host: &str) -> String {
        format!(
            "{} -q {} {}",
            self.ssh,
            host,
            quote(&format!("{} -s", self.shell))
        )
    }

    /// Write the job script and return its path
    pub fn prepare(&self, job_id: usize, command: &str, log: &Path) -> EngineResult<PathBuf> {
        fs::create_dir_all(&self.script_dir).map_err(|e| {
            EngineError::internal(format!(
                "cannot create {}: {}",
                self.script_dir.display(),
                e
            ))
        })?;

        let script = self.script_path(job_id);
        let content = Self::render_script(command, log, &self.pid_path(job_id));
        fs::write(&script, content).map_err(|e| {
            EngineError::internal(format!("cannot write {}: {}", script.display(), e))
        })?;
        Ok(script)
    }

    /// Run `command` for job `job_id` on its host; returns the exit status
    pub async fn run(&self, job_id: usize, command: &str, log: &Path) -> EngineResult<i32> {
        let script = self.prepare(job_id, command, log)?;
        let host = self.host_for(job_id);
        tracing::debug!(job_id, host, command, "dispatching to remote host");

        let status = self
            .runner
            .run_logged_with_input(&self.ssh_command(host), &script, log, &ShellConfig::default())
            .await;

        if let Err(e) = fs::remove_file(&script) {
            tracing::debug!(script = %script.display(), error = %e, "could not remove job script");
        }
        Ok(status)
    }

    /// Hang up every job among the first `jobs` that still has a pid file
    pub async fn hang_up_outstanding(&self, jobs: usize) {
        for job_id in 0..jobs {
            let pid_file = self.pid_path(job_id);
            let Ok(content) = fs::read_to_string(&pid_file) else {
                continue;
            };

            match content.trim().parse::<i32>() {
                Ok(pid) => {
                    let host = self.host_for(job_id);
                    tracing::info!(job_id, host, pid, "killing remote job");
                    let output = self
                        .runner
                        .run_script(
                            &format!("{} -q {} kill -HUP {}", self.ssh, host, pid),
                            &ShellConfig::default(),
                        )
                        .await;
                    if output.exit_code != 0 {
                        tracing::warn!(job_id, host, pid, stderr = %output.stderr, "remote kill failed");
                    }
                }
                Err(_) => {
                    tracing::warn!(pid_file = %pid_file.display(), "unreadable pid file");
                }
            }

            let _ = fs::remove_file(&pid_file);
            let _ = fs::remove_file(self.script_path(job_id));
        }
    }
}
