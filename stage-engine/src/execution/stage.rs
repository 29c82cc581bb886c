// Stage
// A barrier-synchronized group of tasks dispatched to the worker pool together

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::logs::{find_error, merge_into_job_log};
use crate::execution::scheduler::Scheduler;
use crate::execution::task::Task;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Status recorded for a task whose job never reported back (it panicked)
const LOST_TASK_STATUS: i32 = 1;

/// An ordered group of tasks that run concurrently and complete as one.
///
/// Tasks are added until the stage runs; from then on the stage is sealed.
/// Running a stage consumes its tasks: each is executed exactly once and
/// dropped with the stage.
pub struct Stage {
    job_name: String,
    config: EngineConfig,
    tasks: Vec<Box<dyn Task>>,
    logs: Vec<PathBuf>,
    status: Arc<Mutex<BTreeMap<usize, i32>>>,
    started: bool,
}

impl Stage {
    pub fn new(job_name: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            job_name: job_name.into(),
            config: config.clone(),
            tasks: Vec::new(),
            logs: Vec::new(),
            status: Arc::new(Mutex::new(BTreeMap::new())),
            started: false,
        }
    }

    /// Append a task, assigning it the next per-task log
    pub fn add(&mut self, mut task: Box<dyn Task>) -> EngineResult<()> {
        if self.started {
            return Err(EngineError::internal(format!(
                "cannot add task '{}' to a stage of {} that already started",
                task.name(),
                self.job_name
            )));
        }

        let log = self
            .config
            .task_log_path(&self.job_name, self.logs.len());
        task.set_log_path(&log);
        self.logs.push(log);
        self.tasks.push(task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn logs(&self) -> &[PathBuf] {
        &self.logs
    }

    /// Nonzero exit statuses recorded so far, by task index
    pub fn failures(&self) -> BTreeMap<usize, i32> {
        self.status.lock().clone()
    }

    /// Run every task on the scheduler's pool and wait for all of them.
    ///
    /// All tasks are checked before any is dispatched. Once dispatched, every
    /// task runs to completion whatever its siblings do. Task logs are then
    /// appended to the job log in task order and removed. Fails with
    /// [`EngineError::StageFailed`] if any task exited nonzero.
    pub async fn run(&mut self, scheduler: &Scheduler) -> EngineResult<()> {
        if self.started {
            return Err(EngineError::internal(format!(
                "stage of {} already ran",
                self.job_name
            )));
        }
        self.started = true;
        let start = Instant::now();

        for task in &self.tasks {
            task.check()?;
        }

        let mut pending = Vec::with_capacity(self.tasks.len());
        let mut dispatch_error = None;

        let mut tasks = std::mem::take(&mut self.tasks)
            .into_iter()
            .zip(self.logs.clone())
            .enumerate();

        for (idx, (mut task, log)) in tasks.by_ref() {
            if scheduler.pool().is_stopped() {
                task.teardown().await;
                dispatch_error = Some(EngineError::internal("worker pool is stopped"));
                break;
            }

            let executor = scheduler.executor();
            let status = Arc::clone(&self.status);

            let submitted = scheduler.pool().submit(async move {
                let code = executor.execute(task.as_mut(), &log).await;
                task.teardown().await;
                if code != 0 {
                    tracing::debug!(task = idx, code, "task in stage failed");
                    status.lock().insert(idx, code);
                }
            });

            match submitted {
                Ok(done) => pending.push((idx, done)),
                Err(e) => {
                    tracing::error!(task = idx, error = %e, "pool refused task");
                    dispatch_error = Some(e);
                    break;
                }
            }
        }

        // Tasks that never reached a worker still get their teardown
        for (_, (mut task, _)) in tasks {
            task.teardown().await;
        }

        let (indexes, receivers): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let results = futures::future::join_all(receivers).await;
        for (idx, result) in indexes.into_iter().zip(results) {
            if result.is_err() {
                tracing::error!(task = idx, "task was lost before reporting a status");
                self.status.lock().entry(idx).or_insert(LOST_TASK_STATUS);
            }
        }

        let failures = self.failures();
        let summary = if failures.is_empty() {
            None
        } else {
            let failed_logs: Vec<PathBuf> =
                failures.keys().map(|idx| self.logs[*idx].clone()).collect();
            let summary = find_error(&failed_logs);
            if let Some(message) = &summary {
                tracing::error!(
                    "Command failed with the following error message:\n{}",
                    message.trim_end()
                );
            }
            summary
        };

        let merged = merge_into_job_log(&self.logs, scheduler.job_log());
        if let Err(e) = &merged {
            tracing::warn!(
                job_log = %scheduler.job_log().display(),
                error = %e,
                "could not consolidate task logs"
            );
        }

        tracing::debug!(
            job = %self.job_name,
            tasks = self.logs.len(),
            failed = failures.len(),
            "Stage finishes in {:.1} seconds",
            start.elapsed().as_secs_f64()
        );

        if let Some(e) = dispatch_error {
            return Err(e);
        }
        if !failures.is_empty() {
            return Err(EngineError::StageFailed {
                job: self.job_name.clone(),
                log: scheduler.job_log().to_path_buf(),
                summary,
            });
        }
        merged.map_err(EngineError::from)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("job_name", &self.job_name)
            .field("logs", &self.logs)
            .field("started", &self.started)
            .finish()
    }
}
