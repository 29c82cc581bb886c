// Scheduler
// Owns the worker pool and the FIFO stage queue of one job

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::pool::WorkerPool;
use crate::execution::remote::RemoteDispatcher;
use crate::execution::stage::Stage;
use crate::execution::task::Task;
use crate::runners::{ShellConfig, ShellRunner};

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status recorded for a task whose setup failed
const SETUP_FAILURE_STATUS: i32 = 1;

/// Executes one task on a pool worker: setup, command, exit status.
///
/// Shared by every job the scheduler posts. Numbers jobs for the lifetime of
/// the scheduler, which is what remote dispatch uses to pick hosts and name
/// scripts.
#[derive(Debug)]
pub struct TaskExecutor {
    runner: ShellRunner,
    shell_config: ShellConfig,
    remote: Option<RemoteDispatcher>,
    next_job: AtomicUsize,
}

impl TaskExecutor {
    fn new(remote: Option<RemoteDispatcher>) -> Self {
        Self {
            runner: ShellRunner::new(),
            shell_config: ShellConfig::default(),
            remote,
            next_job: AtomicUsize::new(0),
        }
    }

    /// Jobs started so far
    pub fn jobs_started(&self) -> usize {
        self.next_job.load(Ordering::SeqCst)
    }

    /// Set up `task` and run its command with output captured to `log`
    pub async fn execute(&self, task: &mut dyn Task, log: &Path) -> i32 {
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = task.setup().await {
            tracing::error!(job_id, task = task.name(), error = %e, "Failed to setup job execution");
            if let Err(write_err) = fs::write(log, format!("setup failed: {}\n", e)) {
                tracing::warn!(log = %log.display(), error = %write_err, "cannot write task log");
            }
            return SETUP_FAILURE_STATUS;
        }

        let command = task.command().to_string();
        tracing::debug!(job_id, task = task.name(), command = %command, "executing task");

        match &self.remote {
            Some(remote) if task.resources().processes == 1 => {
                match remote.run(job_id, &command, log).await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::error!(job_id, error = %e, "remote dispatch failed");
                        SETUP_FAILURE_STATUS
                    }
                }
            }
            _ => self.runner.run_logged(&command, log, &self.shell_config).await,
        }
    }
}

/// Runs a job as a queue of stages over a fixed worker pool.
///
/// Callers add tasks with [`add_task`](Self::add_task); passing
/// `new_stage = true` opens a new stage, so the task waits for everything
/// added before it. [`run`](Self::run) then executes stages strictly in
/// order, stopping at the first failed stage.
///
/// The pool starts at construction, so a scheduler must be created inside a
/// tokio runtime.
pub struct Scheduler {
    job_name: String,
    config: EngineConfig,
    pool: WorkerPool,
    stages: VecDeque<Stage>,
    executor: Arc<TaskExecutor>,
    job_log: PathBuf,
    stopped: bool,
}

impl Scheduler {
    pub fn new(job_name: impl Into<String>, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let job_name = job_name.into();
        let remote = RemoteDispatcher::from_config(&config)?;
        let pool = WorkerPool::new(config.workers);
        let job_log = config.job_log_path(&job_name);

        tracing::debug!(
            job = %job_name,
            workers = pool.size(),
            remote = remote.is_some(),
            "scheduler started"
        );

        Ok(Self {
            job_name,
            pool,
            stages: VecDeque::new(),
            executor: Arc::new(TaskExecutor::new(remote)),
            job_log,
            config,
            stopped: false,
        })
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Path of the consolidated job log
    pub fn job_log(&self) -> &Path {
        &self.job_log
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pending_stages(&self) -> usize {
        self.stages.len()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn executor(&self) -> Arc<TaskExecutor> {
        Arc::clone(&self.executor)
    }

    /// Queue a task, in a new stage if `new_stage` is set or none exists yet
    pub fn add_task(&mut self, task: impl Task + 'static, new_stage: bool) -> EngineResult<()> {
        self.add_boxed(Box::new(task), new_stage)
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>, new_stage: bool) -> EngineResult<()> {
        if self.stopped {
            return Err(EngineError::internal("scheduler is stopped"));
        }
        if new_stage || self.stages.is_empty() {
            self.stages.push_back(Stage::new(&self.job_name, &self.config));
        }
        match self.stages.back_mut() {
            Some(stage) => stage.add(task),
            None => Err(EngineError::internal("no stage to add the task to")),
        }
    }

    /// Run queued stages in order until the queue is empty or a stage fails.
    ///
    /// A failed stage halts the job: stages queued behind it are discarded
    /// without running, and the error names the job log.
    pub async fn run(&mut self) -> EngineResult<()> {
        if self.stopped {
            return Err(EngineError::internal("scheduler is stopped"));
        }
        let start = Instant::now();

        fs::create_dir_all(&self.config.log_dir).map_err(|e| {
            EngineError::internal(format!(
                "cannot create log dir {}: {}",
                self.config.log_dir.display(),
                e
            ))
        })?;

        tracing::info!(job = %self.job_name, stages = self.stages.len(), "Start doing {}", self.job_name);

        while let Some(mut stage) = self.stages.pop_front() {
            if let Err(e) = stage.run(self).await {
                let skipped = self.stages.len();
                self.stages.clear();
                tracing::error!(job = %self.job_name, skipped_stages = skipped, error = %e, "job halted");
                return Err(e);
            }
        }

        tracing::info!(
            job = %self.job_name,
            "{} finishes in {} seconds",
            self.job_name,
            start.elapsed().as_secs()
        );
        Ok(())
    }

    /// Stop the pool after in-flight work drains, then hang up remote jobs
    /// that are still running and drop the default scratch directory
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.pool.stop().await;
        if let Some(remote) = &self.executor.remote {
            remote.hang_up_outstanding(self.executor.jobs_started()).await;
        }
        self.config.clean_temp_dir();
        tracing::debug!(job = %self.job_name, "scheduler stopped");
    }

    /// Abandon the job after an interrupt.
    ///
    /// Refuses further work and hangs up remote jobs still in flight, without
    /// waiting for the pool to drain.
    pub async fn interrupt(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(remote) = &self.executor.remote {
            remote.hang_up_outstanding(self.executor.jobs_started()).await;
        }
        tracing::warn!(job = %self.job_name, "job interrupted");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.stopped || self.executor.remote.is_none() {
            return;
        }
        // The pool closes its own queue on drop; remote cleanup needs the runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let executor = Arc::clone(&self.executor);
            handle.spawn(async move {
                if let Some(remote) = &executor.remote {
                    remote.hang_up_outstanding(executor.jobs_started()).await;
                }
            });
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("job_name", &self.job_name)
            .field("workers", &self.pool.size())
            .field("pending_stages", &self.stages.len())
            .field("job_log", &self.job_log)
            .finish()
    }
}
