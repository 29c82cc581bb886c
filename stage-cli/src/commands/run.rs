use crate::commands::broker::shutdown_signal;
use crate::output;

use std::future::Future;
use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use stage_engine::{BackgroundRunner, EngineConfig, EngineError, Scheduler, ShellTask};

/// Run a command list as a staged job
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command list: one shell command per line, a blank line starts a new stage
    pub commands: PathBuf,

    /// Job name used for log files (default: command list file name)
    #[arg(long, short = 'j', value_name = "NAME")]
    pub job: Option<String>,

    /// Tasks of a stage running at once
    #[arg(long, short = 'w', value_name = "N")]
    pub workers: Option<usize>,

    /// Engine configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for job logs
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Command kept running in the background for the whole job
    #[arg(long, value_name = "CMD")]
    pub sidecar: Option<String>,
}

/// Split a command list into stages.
///
/// `#` lines are comments; one or more blank lines end a stage.
pub fn parse_command_list(content: &str) -> Vec<Vec<String>> {
    let mut stages: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in content.lines() {
        let command = line.trim();
        if command.is_empty() {
            if !current.is_empty() {
                stages.push(std::mem::take(&mut current));
            }
        } else if !command.starts_with('#') {
            current.push(command.to_string());
        }
    }
    if !current.is_empty() {
        stages.push(current);
    }
    stages
}

fn job_name(args: &RunArgs) -> String {
    args.job.clone().unwrap_or_else(|| {
        args.commands
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("job")
            .to_string()
    })
}

fn load_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn read_stages(path: &Path) -> Result<Vec<Vec<String>>> {
    if !path.exists() {
        color_eyre::eyre::bail!("Command list not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Cannot read {}", path.display()))?;
    let stages = parse_command_list(&content);
    if stages.is_empty() {
        color_eyre::eyre::bail!("No commands in {}", path.display());
    }
    Ok(stages)
}

/// How a job ended when it did not error out
#[derive(Debug)]
pub enum JobOutcome {
    Finished { log: PathBuf },
    Failed(EngineError),
    Interrupted,
}

/// Run the job described by `args` until it ends or `interrupt` resolves.
///
/// The sidecar, if any, is shut down either way. An interrupted job hangs up
/// its remote work and leaves local commands to the signal that stopped it.
pub async fn run_job(args: &RunArgs, interrupt: impl Future<Output = ()>) -> Result<JobOutcome> {
    let config = load_config(args)?;
    let stages = read_stages(&args.commands)?;
    let job = job_name(args);

    let tasks: usize = stages.iter().map(Vec::len).sum();
    output::status("Running", &format!("{} ({} stages, {} tasks)", job, stages.len(), tasks));

    let mut scheduler = Scheduler::new(&job, config.clone())?;
    for stage in stages {
        for (idx, command) in stage.into_iter().enumerate() {
            scheduler.add_task(ShellTask::new(command), idx == 0)?;
        }
    }

    let mut sidecar = match &args.sidecar {
        Some(command) => {
            let runner = BackgroundRunner::start(
                &job,
                ShellTask::new(command.clone()).with_name("sidecar"),
                &config,
            )
            .await?;
            output::info(&format!("Sidecar log: {}", runner.log_path().display()));
            Some(runner)
        }
        None => None,
    };

    let result = tokio::select! {
        result = scheduler.run() => Some(result),
        _ = interrupt => None,
    };

    if let Some(runner) = sidecar.as_mut() {
        runner.shutdown().await;
    }

    let Some(result) = result else {
        scheduler.interrupt().await;
        return Ok(JobOutcome::Interrupted);
    };
    scheduler.stop().await;

    match result {
        Ok(()) => Ok(JobOutcome::Finished {
            log: scheduler.job_log().to_path_buf(),
        }),
        Err(err @ EngineError::StageFailed { .. }) => Ok(JobOutcome::Failed(err)),
        Err(err) => Err(err.into()),
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let job = job_name(&args);

    match run_job(&args, shutdown_signal()).await? {
        JobOutcome::Finished { log } => {
            output::success(&format!("{} finished, log: {}", job, log.display()));
            Ok(())
        }
        JobOutcome::Failed(err) => {
            output::failure(&err.to_string());
            if let EngineError::StageFailed {
                summary: Some(summary),
                ..
            } = &err
            {
                for line in summary.lines() {
                    output::dim(&format!("    {}", line));
                }
            }
            std::process::exit(1);
        }
        JobOutcome::Interrupted => {
            output::failure(&format!("{} interrupted", job));
            std::process::exit(130);
        }
    }
}
