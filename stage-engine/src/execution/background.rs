// Background Runner
// Detaches one task into a supervised sidecar process that dies with its owner

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::task::Task;
use crate::runners::{exit_code, quote};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long `shutdown` waits after SIGTERM before escalating to SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A long-lived task running outside the stage barrier.
///
/// `start` validates and prepares the task in the caller, writes its command
/// into a generated script and spawns that script as the leader of a new
/// process group, then returns without waiting. The sidecar lives until
/// [`shutdown`](Self::shutdown) is awaited or the runner is dropped; either
/// way the whole process group gets SIGTERM and the script is deleted.
pub struct BackgroundRunner {
    job_name: String,
    script: PathBuf,
    log: PathBuf,
    child: Option<Child>,
    pid: Option<u32>,
    task: Option<Box<dyn Task>>,
}

impl BackgroundRunner {
    /// Start `task` as the sidecar for `job_name`
    pub async fn start(
        job_name: impl Into<String>,
        task: impl Task + 'static,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        Self::start_boxed(job_name, Box::new(task), config).await
    }

    pub async fn start_boxed(
        job_name: impl Into<String>,
        mut task: Box<dyn Task>,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let job_name = job_name.into();
        task.check()?;
        fs::create_dir_all(&config.log_dir)?;
        task.setup().await?;

        let log = config.background_log_path(&job_name);
        task.set_log_path(&log);

        let script_dir = config.temp_dir.join("background");
        let script = script_dir.join(format!("job-{}.sh", job_name));
        if let Err(e) = write_script(&script_dir, &script, task.command(), &log) {
            task.teardown().await;
            return Err(e);
        }

        let mut cmd = Command::new(&script);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_file(&script);
                task.teardown().await;
                return Err(EngineError::internal(format!(
                    "cannot start background job {}: {}",
                    job_name, e
                )));
            }
        };
        let pid = child.id();

        tracing::info!(
            job = %job_name,
            pid,
            log = %log.display(),
            "started background job"
        );

        Ok(Self {
            job_name,
            script,
            log,
            child: Some(child),
            pid,
            task: Some(task),
        })
    }

    /// Process id of the sidecar's script, also its process group id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub fn log_path(&self) -> &Path {
        &self.log
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Whether the sidecar is still running
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | Some(Err(_)) | None => false,
        }
    }

    /// Terminate the sidecar and wait for it, then clean up.
    ///
    /// Returns the sidecar's exit status, or `None` if it was already shut
    /// down or could not be waited on.
    pub async fn shutdown(&mut self) -> Option<i32> {
        let mut child = self.child.take()?;

        if matches!(child.try_wait(), Ok(None)) {
            self.signal_group(Signal::SIGTERM);
        }
        let status = match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(exit_code(status)),
            Ok(Err(e)) => {
                tracing::warn!(job = %self.job_name, error = %e, "cannot wait for background job");
                None
            }
            Err(_) => {
                tracing::warn!(job = %self.job_name, "background job ignored SIGTERM, killing it");
                self.signal_group(Signal::SIGKILL);
                child.wait().await.ok().map(exit_code)
            }
        };

        self.pid = None;
        self.remove_script();
        if let Some(mut task) = self.task.take() {
            task.teardown().await;
        }
        tracing::debug!(job = %self.job_name, status, "background job shut down");
        status
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else { return };
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, signal) {
            tracing::debug!(job = %self.job_name, pid, error = %e, "cannot signal background job");
        }
    }

    fn remove_script(&self) {
        if let Err(e) = fs::remove_file(&self.script) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(script = %self.script.display(), error = %e, "cannot remove background script");
            }
        }
    }
}

impl Drop for BackgroundRunner {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(None)) {
            tracing::info!(job = %self.job_name, pid = self.pid, "killing background job");
            self.signal_group(Signal::SIGTERM);
        }
        self.remove_script();

        // Reap the child and finish the task off the dropping thread
        let task = self.task.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = child.wait().await;
                if let Some(mut task) = task {
                    task.teardown().await;
                }
            });
        }
    }
}

impl std::fmt::Debug for BackgroundRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRunner")
            .field("job_name", &self.job_name)
            .field("pid", &self.pid)
            .field("script", &self.script)
            .field("log", &self.log)
            .finish()
    }
}

/// Script wrapping `command`: the sidecar runs as a background job so a
/// trapped signal interrupts `wait`, and the exit trap takes its children
/// down with it
fn render_script(command: &str, log: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         trap 'exit 143' TERM HUP INT\n\
         trap 'kill $(jobs -p) 2>/dev/null' EXIT\n\
         ( {command} ) > {log} 2>&1 &\n\
         wait\n",
        command = command,
        log = quote(&log.to_string_lossy()),
    )
}

fn write_script(dir: &Path, script: &Path, command: &str, log: &Path) -> EngineResult<()> {
    fs::create_dir_all(dir).map_err(|e| {
        EngineError::internal(format!("cannot create {}: {}", dir.display(), e))
    })?;
    fs::write(script, render_script(command, log)).map_err(|e| {
        EngineError::internal(format!("cannot write {}: {}", script.display(), e))
    })?;
    fs::set_permissions(script, fs::Permissions::from_mode(0o755)).map_err(|e| {
        EngineError::internal(format!("cannot make {} executable: {}", script.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::task::ShellTask;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            log_dir: dir.join("log"),
            temp_dir: dir.join("tmp"),
            ..EngineConfig::default()
        }
    }

    fn alive(pid: u32) -> bool {
        nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Polls until `pid` is gone, yielding so the reaper task can run
    async fn wait_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    struct CountingTask {
        command: String,
        setups: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Task for CountingTask {
        async fn setup(&mut self) -> EngineResult<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn command(&self) -> &str {
            &self.command
        }

        async fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_script_traps_and_waits() {
        let script = render_script("sleep 100", Path::new("/tmp/x.log"));
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("trap 'kill $(jobs -p) 2>/dev/null' EXIT"));
        assert!(script.contains("( sleep 100 ) > '/tmp/x.log' 2>&1 &"));
        assert!(script.ends_with("wait\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_runs_setup_and_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let setups = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let task = CountingTask {
            command: "echo sidecar-up; sleep 30".to_string(),
            setups: Arc::clone(&setups),
            teardowns: Arc::clone(&teardowns),
        };

        let started = Instant::now();
        let mut runner = BackgroundRunner::start("blaze", task, &config(dir.path()))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert!(runner.is_running());
        assert!(runner.script_path().exists());
        assert_eq!(runner.log_path(), dir.path().join("log/blaze.background.log"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline
            && !fs::read_to_string(runner.log_path())
                .map(|log| log.contains("sidecar-up"))
                .unwrap_or(false)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = runner.shutdown().await;

        assert_eq!(status, Some(143));
        assert!(!runner.script_path().exists());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(runner.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_kills_process_and_removes_script() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let task = ShellTask::new(format!("sleep 1; touch {}", marker.display()));

        let runner = BackgroundRunner::start("drop", task, &config(dir.path()))
            .await
            .unwrap();
        let pid = runner.pid().unwrap();
        let script = runner.script_path().to_path_buf();
        assert!(alive(pid));

        drop(runner);

        assert!(!script.exists());
        assert!(wait_gone(pid).await);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_invalid_task_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();

        let err = BackgroundRunner::start("blank", ShellTask::new(" "), &config(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!dir.path().join("tmp/background").exists());
    }

    #[tokio::test]
    async fn test_unwritable_script_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the script directory should be
        fs::write(dir.path().join("tmp"), "").unwrap();

        let err = BackgroundRunner::start("noscript", ShellTask::new("sleep 5"), &config(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[tokio::test]
    async fn test_finished_sidecar_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = BackgroundRunner::start("quick", ShellTask::new("true"), &config(dir.path()))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!runner.is_running());
        assert!(runner.shutdown().await.is_some());
        assert!(!runner.script_path().exists());
    }
}
